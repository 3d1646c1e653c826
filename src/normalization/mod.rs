pub mod name;
pub mod slug;

pub use name::normalize;
pub use slug::slug_for_key;
