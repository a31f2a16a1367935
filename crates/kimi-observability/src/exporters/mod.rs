pub mod console;
pub mod otlp;
