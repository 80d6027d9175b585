mod lapin;

pub use lapin::create_amqp_transport;
