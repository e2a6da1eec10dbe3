use lazy_static::lazy_static;
use std::collections::HashSet;

/// Known database command names (lowercase)
///
/// A QUERY whose first key is one of these names is reported as a command,
/// whatever the collection. Other keys are not looked at.
const DATABASE_COMMANDS: &[&str] = &[
    // aggregation
    "aggregate",
    "count",
    "distinct",
    "group",
    "mapreduce",
    // geospatial
    "geonear",
    "geosearch",
    // query and write
    "find",
    "insert",
    "update",
    "delete",
    "findandmodify",
    "getmore",
    "getlasterror",
    "getpreverror",
    "reseterror",
    "eval",
    "parallelcollectionscan",
    // query plan cache
    "plancachelistfilters",
    "plancachesetfilter",
    "plancacheclearfilters",
    "plancachelistqueryshapes",
    "plancachelistplans",
    "plancacheclear",
    // authentication
    "logout",
    "authenticate",
    "copydbgetnonce",
    "getnonce",
    "saslstart",
    "saslcontinue",
    // user and role management
    "createuser",
    "updateuser",
    "dropuser",
    "dropallusersfromdatabase",
    "grantrolestouser",
    "revokerolesfromuser",
    "usersinfo",
    "createrole",
    "updaterole",
    "droprole",
    "dropallrolesfromdatabase",
    "grantprivilegestorole",
    "revokeprivilegesfromrole",
    "grantrolestorole",
    "revokerolesfromrole",
    "rolesinfo",
    "invalidateusercache",
    // replication
    "replsetfreeze",
    "replsetgetstatus",
    "replsetinitiate",
    "replsetmaintenance",
    "replsetreconfig",
    "replsetstepdown",
    "replsetsyncfrom",
    "resync",
    "applyops",
    "ismaster",
    "hello",
    "replsetgetconfig",
    // sharding
    "flushrouterconfig",
    "addshard",
    "cleanuporphaned",
    "checkshardingindex",
    "enablesharding",
    "listshards",
    "removeshard",
    "getshardmap",
    "getshardversion",
    "mergechunks",
    "setshardversion",
    "shardcollection",
    "shardingstate",
    "unsetsharding",
    "split",
    "splitchunk",
    "splitvector",
    "mediankey",
    "movechunk",
    "moveprimary",
    "isdbgrid",
    // instance administration
    "renamecollection",
    "copydb",
    "dropdatabase",
    "listcollections",
    "drop",
    "create",
    "clone",
    "clonecollection",
    "clonecollectionascapped",
    "converttocapped",
    "filemd5",
    "createindexes",
    "listindexes",
    "dropindexes",
    "fsync",
    "clean",
    "connectionstatus",
    "collmod",
    "reindex",
    "setparameter",
    "getparameter",
    "repairdatabase",
    "repaircursor",
    "touch",
    "shutdown",
    "logrotate",
    "killop",
    "killcursors",
    "endsessions",
    "startsession",
    "aborttransaction",
    "committransaction",
    // diagnostics
    "availablequeryoptions",
    "buildinfo",
    "collstats",
    "connpoolstats",
    "connpoolsync",
    "cursorinfo",
    "datasize",
    "dbhash",
    "dbstats",
    "diaglogging",
    "driveroidtest",
    "explain",
    "features",
    "getcmdlineopts",
    "getlog",
    "hostinfo",
    "_isself",
    "listcommands",
    "listdatabases",
    "netstat",
    "ping",
    "profile",
    "serverstatus",
    "shardconnpoolstats",
    "top",
    "validate",
    "whatsmyuri",
    // internal
    "handshake",
    "_recvchunkabort",
    "_recvchunkcommit",
    "_recvchunkstart",
    "_recvchunkstatus",
    "_replsetfresh",
    "mapreduce.shardedfinish",
    "_transfermods",
    "replsetheartbeat",
    "replsetgetrbid",
    "_migrateclone",
    "replsetelect",
    "writeback",
    "writebackslisten",
    "gleerrors",
    // testing
    "testdistlockwithskew",
    "testdistlockwithsynccluster",
    "captrunc",
    "emptycapped",
    "godinsert",
    "_hashbsonelement",
    "journallatencytest",
    "sleep",
    "replsettest",
    "forceerror",
    "skewclusterstime",
    "configureFailPoint",
];

lazy_static! {
    static ref COMMANDS: HashSet<String> = DATABASE_COMMANDS
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect();
}

/// Test if `name` is a known database command (case-insensitive)
pub fn is_database_command(name: &str) -> bool {
    COMMANDS.contains(&name.to_ascii_lowercase())
}
