//! Transaction submission for ledger writes

mod sender;

pub use sender::TransactionSender;
