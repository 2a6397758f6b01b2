mod bucket_claim;
mod object_store;

pub use bucket_claim::*;
pub use object_store::*;
