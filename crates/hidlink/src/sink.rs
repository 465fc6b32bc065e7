//! Transport → coordinator back channel
//!
//! Transports never touch device records. They hold a sink bound to their
//! device ID and report what happened; the coordinator decides what the
//! record's next state is.

use protocol::HidError;

pub trait ReportSink: Send + Sync {
    /// Input report read from the device, in hardware order
    ///
    /// The buffer is handed over; the coordinator returns it to the pool.
    fn dispatch_input(&self, bytes: Vec<u8>);

    /// Structural failure; the transport has stopped delivering reports
    fn transport_failed(&self, error: HidError);
}
