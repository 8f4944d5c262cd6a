pub mod app;
pub mod conn;
pub mod gateway;
pub mod render;
pub mod router;
