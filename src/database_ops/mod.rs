pub mod memory;
pub mod pg;
pub mod sink;
pub mod writer;

pub use memory::MemorySink;
pub use pg::{Db, PgSink};
pub use sink::Sink;
pub use writer::{BatchWriter, WriterConfig};
