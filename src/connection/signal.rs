//! Signals: notices and asynchronous notifications.
//!
//! Signals are server messages not tied to a specific request. They are
//! queued as the connection pumps bytes and delivered either through the
//! queue accessors or through the handlers during blocking waits.
use std::fmt;

use crate::{
    common::ByteStr,
    postgres::{ServerFields, backend},
};

/// An unsolicited server diagnostic, carried by `NoticeResponse`.
pub struct Notice {
    fields: ServerFields,
}

impl Notice {
    pub(crate) fn new(fields: ServerFields) -> Self {
        Self { fields }
    }

    /// Returns the severity: WARNING, NOTICE, DEBUG, INFO or LOG.
    pub fn severity(&self) -> &str {
        &self.fields.severity
    }

    /// Returns the SQLSTATE code.
    pub fn code(&self) -> &str {
        &self.fields.code
    }

    /// Returns the primary human-readable message.
    pub fn message(&self) -> &str {
        &self.fields.message
    }

    /// Returns all reported fields.
    pub fn fields(&self) -> &ServerFields {
        &self.fields
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fields, f)
    }
}

impl fmt::Debug for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A `LISTEN`/`NOTIFY` event, carried by `NotificationResponse`.
pub struct Notification {
    process_id: u32,
    channel: ByteStr,
    payload: ByteStr,
}

impl Notification {
    /// The process ID of the notifying backend.
    pub fn server_pid(&self) -> u32 {
        self.process_id
    }

    /// The channel the notify has been raised on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The payload string passed from the notifying process.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl From<backend::NotificationResponse> for Notification {
    fn from(message: backend::NotificationResponse) -> Self {
        Self {
            process_id: message.process_id,
            channel: message.channel,
            payload: message.payload,
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("server_pid", &self.process_id)
            .field("channel", &self.channel)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Called for each queued [`Notice`] during blocking waits.
pub type NoticeHandler = Box<dyn FnMut(Notice) + Send>;

/// Called for each queued [`Notification`] during blocking waits.
pub type NotificationHandler = Box<dyn FnMut(Notification) + Send>;

/// One line to the process diagnostic sink, never fails.
pub(crate) fn default_notice_handler(notice: &Notice) {
    crate::common::warning!("{notice}");
    #[cfg(not(feature = "log"))]
    eprintln!("{notice}");
}
