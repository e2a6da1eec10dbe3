use crate::duration::Duration;
use crate::error::Error;
use std::io;

/// Layered key/value configuration, backed by a TOML document
///
/// Keys are paths: `protocols.pgsql.ports` refers to the `ports` entry of
/// the `[protocols.pgsql]` table.
#[derive(Clone, Debug)]
pub struct Config {
    value: toml::Value,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            value: toml::Value::Table(toml::map::Map::new()),
        }
    }
}

impl Config {
    fn lookup(&self, k: &str) -> Option<&toml::Value> {
        let mut item = &self.value;
        for key in k.split('.') {
            item = item.get(key)?;
        }
        Some(item)
    }

    /// Get an entry by path. If the input argument contains dots, the path is split
    /// into keys, each key being requested recursively.
    pub fn get<T: AsRef<str>>(&self, k: T) -> Option<&str> {
        self.lookup(k.as_ref())?.as_str()
    }

    /// Get an entry of type integer by path
    pub fn get_usize<T: AsRef<str>>(&self, k: T) -> Option<usize> {
        self.lookup(k.as_ref())?
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
    }

    /// Get a number of seconds by path
    ///
    /// Returns an error if the value does not fit in the capture clock.
    pub fn get_secs<T: AsRef<str>>(&self, k: T) -> Result<Option<Duration>, Error> {
        let k = k.as_ref();
        match self.lookup(k).and_then(|v| v.as_integer()) {
            Some(i) => u32::try_from(i)
                .map(|s| Some(Duration::from_secs(s)))
                .map_err(|_| Error::Config(format!("{}: invalid number of seconds {}", k, i))),
            None => Ok(None),
        }
    }

    /// Get an entry of type boolean by path
    pub fn get_bool<T: AsRef<str>>(&self, k: T) -> Option<bool> {
        self.lookup(k.as_ref())?.as_bool()
    }

    /// Get a list of port numbers by path
    ///
    /// Entries that are not valid port numbers are ignored.
    pub fn get_u16_list<T: AsRef<str>>(&self, k: T) -> Option<Vec<u16>> {
        let array = self.lookup(k.as_ref())?.as_array()?;
        let v = array
            .iter()
            .filter_map(|item| item.as_integer())
            .filter_map(|i| u16::try_from(i).ok())
            .collect();
        Some(v)
    }

    /// Set an entry by path, creating intermediate tables if needed
    ///
    /// Returns an error if an intermediate key already exists and is not a table.
    pub fn set<T: AsRef<str>, V: Into<toml::Value>>(&mut self, k: T, v: V) -> Result<(), Error> {
        let k = k.as_ref();
        let mut keys: Vec<&str> = k.split('.').collect();
        let last = keys.pop().ok_or(Error::Generic("empty configuration key"))?;
        let mut item = &mut self.value;
        for key in keys {
            let table = item
                .as_table_mut()
                .ok_or_else(|| Error::Config(format!("{}: not a table", k)))?;
            item = table
                .entry(key)
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        }
        let table = item
            .as_table_mut()
            .ok_or_else(|| Error::Config(format!("{}: not a table", k)))?;
        table.insert(last.to_owned(), v.into());
        Ok(())
    }

    /// Load configuration from input object. If keys are already present, they are overwritten
    pub fn load_config<R: io::Read>(&mut self, mut config: R) -> Result<(), Error> {
        let mut s = String::new();
        config.read_to_string(&mut s)?;
        let table = toml::from_str::<toml::Table>(&s)
            .map_err(|e| Error::Config(format!("Load configuration failed: {}", e)))?;
        merge(&mut self.value, toml::Value::Table(table));
        Ok(())
    }
}

fn merge(dst: &mut toml::Value, src: toml::Value) {
    match (dst, src) {
        (toml::Value::Table(d), toml::Value::Table(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}
