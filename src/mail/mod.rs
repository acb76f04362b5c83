//! Mail-store abstraction — trait seam plus the raw IMAP implementation.

pub mod imap;

pub use imap::ImapStore;

use crate::error::MailError;

/// Remote message identifier, as reported by the store's unseen search.
pub type Uid = String;

/// One authenticated, folder-selected session with the mail store.
///
/// Sessions are scoped to a single poll cycle: opened at cycle start,
/// dropped (tearing down the transport) at cycle end.
pub trait MailSession {
    /// UIDs of all unread messages in the selected folder, in server order.
    fn search_unseen(&mut self) -> Result<Vec<Uid>, MailError>;

    /// Fetch only the `Date` header of a message, leaving flags untouched.
    fn fetch_date_header(&mut self, uid: &str) -> Result<Vec<u8>, MailError>;

    /// Fetch the full raw message.
    fn fetch_full(&mut self, uid: &str) -> Result<Vec<u8>, MailError>;

    /// Set the \Seen flag on a message.
    fn mark_seen(&mut self, uid: &str) -> Result<(), MailError>;

    /// Close and re-select the folder, forcing the store to flush cached state.
    fn reselect(&mut self) -> Result<(), MailError>;
}

/// Factory for per-cycle mail sessions.
pub trait MailStore: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MailSession + '_>, MailError>;
}
