//! MailGate interposes a content-analysis step into an SMTP transaction
//! pipeline. An embedding mail transfer agent delivers the ordered transaction
//! events (connect, greeting, sender, recipients, headers, body, end of
//! message) to a [`filter::ContentFilter`], which stages the message to a
//! per-transaction spool area, hands the spooled content to an external
//! analysis engine over a line-oriented socket protocol, and applies the
//! engine's instructions back onto the live transaction through the
//! [`filter::SmtpTransaction`] mutation API.
//!
//! The crate does not speak SMTP itself and does not analyze content. Both
//! of those live on the far side of its two interfaces.

pub mod config;
pub mod engine;
pub mod filter;
pub mod spool;

pub use filter::{ContentFilter, SmtpTransaction, Verdict};
