use crate::error::Error;
use crate::packet::Frame;

/// Common trait for capture analyzers
pub trait FrameAnalyzer {
    /// Initialization function, call before reading capture data (optional)
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Callback function for every captured frame
    fn handle_frame(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Teardown function, called after reading capture data (optional)
    fn teardown(&mut self) {}
}
