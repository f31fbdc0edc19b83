pub mod publication;
pub mod query;
pub mod table;
