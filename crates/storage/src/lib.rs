//! SQLite persistence for cards, source events, transactions and the links
//! between them. Every function takes a plain connection so callers decide
//! the transaction boundary.

pub mod cards;
pub mod db;
pub mod links;
pub mod source_events;
pub mod transactions;

pub use cards::{find_card_by_last_four, get_card, insert_card, list_cards};
pub use db::{begin_write, create_db, DbPool, StorageError};
pub use links::{
    clear_primary, count_links, delete_link, get_link, insert_link, linked_sources, list_links,
    promotion_candidate, set_primary_flag,
};
pub use source_events::{
    find_source_event_by_hash, get_source_event, insert_source_event, linked_transaction_ids,
    list_source_events, update_parse_result, NewSourceEvent, ParseUpdate, SourceEventFilter,
};
pub use transactions::{
    delete_transaction, find_candidates, get_transaction, insert_transaction, list_transactions,
    transaction_summary, update_transaction, CurrencyTotals, Direction, TransactionFilter,
    TransactionPage, TransactionWrite,
};
