pub mod load;
pub mod relation;
pub mod report;
pub mod schema;
pub mod value;

pub use load::*;
pub use relation::*;
pub use report::*;
pub use schema::*;
pub use value::*;
