use std::sync::Arc;

use anyhow::Context;
use eframe::egui;
use parking_lot::Mutex;
use services::ServiceSupervisor;
use tracing_subscriber::EnvFilter;

mod state;
mod types;
mod ui;
mod utils;

pub use types::AppState;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = utils::load_settings_or_default();
    let paths = utils::data_paths(&settings);
    paths
        .ensure()
        .context("Failed to create data directories")?;
    tracing::info!(
        "Knowledge base at {}, vector store at {}",
        paths.knowledge_base.display(),
        paths.vector_store.display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("docqa-worker")
        .build()
        .context("Failed to start async runtime")?;
    let supervisor = ServiceSupervisor::for_backend(&settings.service, paths);

    {
        let supervisor = supervisor.clone();
        runtime.spawn(async move {
            if let Err(e) = supervisor.start().await {
                // The supervisor keeps retrying; the status bar shows progress.
                tracing::error!("Initial service start failed: {}", e);
            }
        });
    }
    {
        let supervisor = supervisor.clone();
        runtime.spawn(async move {
            state::wait_for_shutdown_signal().await;
            tracing::info!("Shutdown signal received, stopping service");
            supervisor.stop().await;
            std::process::exit(0);
        });
    }

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1200.0, 800.0])
            .with_min_inner_size([800.0, 600.0]),
        vsync: true,
        ..Default::default()
    };
    let handle = runtime.handle().clone();
    let app_supervisor = supervisor.clone();
    let result = eframe::run_native(
        "Document Q&A",
        options,
        Box::new(move |cc| {
            let ctx = cc.egui_ctx.clone();
            let mut status_rx = app_supervisor.subscribe();
            let repaint = ctx.clone();
            handle.spawn(async move {
                while status_rx.changed().await.is_ok() {
                    repaint.request_repaint();
                }
            });
            Box::new(DocQaApp {
                state: Arc::new(Mutex::new(AppState::new(
                    settings,
                    app_supervisor,
                    handle,
                    ctx,
                ))),
            })
        }),
    );

    tracing::info!("Window closed, stopping service");
    runtime.block_on(supervisor.stop());
    result.map_err(|e| anyhow::anyhow!("UI error: {}", e))
}

struct DocQaApp {
    state: Arc<Mutex<AppState>>,
}

impl eframe::App for DocQaApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let mut s = self.state.lock();
        s.poll();

        ctx.set_visuals(if s.settings.dark_mode {
            egui::Visuals::dark()
        } else {
            egui::Visuals::light()
        });

        ui::header(ctx, &mut s);
        ui::notices(ctx, &mut s);
        ui::documents(ctx, &mut s);
        ui::chat(ctx, &mut s);
        ui::settings_window(ctx, &mut s);

        if s.session.is_streaming() || s.docs.busy.is_some() {
            ctx.request_repaint_after(std::time::Duration::from_millis(100));
        }
    }
}
