use anyhow::Result;

pub mod app;
pub mod audience;
pub mod callable;
pub mod cleanup;
pub mod config;
pub mod fcm;
pub mod firestore;
pub mod functions;
pub mod message;
pub mod service_worker;
pub mod store;
pub mod sweep;
pub mod types;

#[cfg(test)]
mod testing;

pub const APP_NAME: &str = "cmmsnotify";

pub fn set_up_logger(calling_module: &'static str, verbose: bool) -> Result<()> {
    jluszcz_rust_utils::set_up_logger(APP_NAME, calling_module, verbose)
}
