//! Database Module - Call Record Store und Chat Log
//!
//! Dieses Modul verwaltet die gemeinsam genutzten Tabellen:
//! - `calls`: Anrufversuche mit Offer, Answer und Status
//! - Change Notifications für Inserts und Updates
//! - `route_messages`: Chat-Zeilen pro Route

mod calls;
mod chat;
mod notify;

pub use calls::{
    CallRecord, CallStatus, CallStore, CallUpdate, NewCallRecord, SqliteCallStore, StoreError,
};
pub use chat::{ChatLog, ChatMessage, SqliteChatLog};
pub use notify::{ChangeEvent, ChangeFilter, ChangeKind, Subscription, CHANGE_CHANNEL_CAPACITY};
