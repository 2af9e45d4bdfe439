mod handler;

pub use handler::ProcessGuard;
