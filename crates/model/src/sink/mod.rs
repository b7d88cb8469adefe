pub mod mutation;
pub mod row_key;
