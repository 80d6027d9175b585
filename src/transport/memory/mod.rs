mod transport;

pub use transport::create_memory_transport;
