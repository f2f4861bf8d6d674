mod result_set;
mod row;

pub use result_set::{ResultSet, RunResult};
pub use row::DbRow;
