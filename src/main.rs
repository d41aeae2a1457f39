mod actions;
mod app;
mod controller;
mod domain;
mod live;
mod overview;
mod presenter;
mod query;
mod storage;
mod store;
mod sync;
mod tabs;

use app::{APP_NAME, TrailerApp};
use eframe::NativeOptions;
use tracing_subscriber::EnvFilter;

fn main() -> eframe::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = NativeOptions::default();
    eframe::run_native(
        APP_NAME,
        options,
        Box::new(|cc| Ok(Box::new(TrailerApp::new(cc)))),
    )
}
