//! Background work for the shell. Each job runs on the shared runtime and
//! reports back over a std channel that the UI drains every frame.

use std::path::PathBuf;
use std::sync::mpsc::Sender;

use client::{ServiceClient, TurnId, TurnUpdate};
use futures::future::{AbortRegistration, Abortable};
use shared::error::ClientError;
use shared::protocol::{FileInfo, UploadReceipt};
use shared::settings::{ServiceSettings, SettingsUpdate};

/// Stream one chat turn. Dropped silently when aborted.
pub async fn run_chat_turn(
    client: ServiceClient,
    message: String,
    turn: TurnId,
    tx: Sender<(TurnId, TurnUpdate)>,
    repaint: egui::Context,
    abort_reg: AbortRegistration,
) {
    let stream = client.stream_turn(&message, |update| {
        let _ = tx.send((turn, update));
        repaint.request_repaint();
    });
    if Abortable::new(stream, abort_reg).await.is_err() {
        tracing::info!("Chat turn {} stopped by user", turn);
    }
}

/// Document-panel operations.
#[derive(Debug, Clone)]
pub enum DocJob {
    Upload(PathBuf),
    Refresh,
    ClearDatabase,
    ClearMemory,
    Search(String),
}

impl DocJob {
    pub fn label(&self) -> &'static str {
        match self {
            DocJob::Upload(_) => "Uploading",
            DocJob::Refresh => "Refreshing",
            DocJob::ClearDatabase => "Clearing database",
            DocJob::ClearMemory => "Clearing memory",
            DocJob::Search(_) => "Searching",
        }
    }

    /// Searches run in the background and leave the panel buttons enabled.
    pub fn blocks_panel(&self) -> bool {
        !matches!(self, DocJob::Search(_))
    }
}

#[derive(Debug)]
pub enum DocResult {
    Uploaded(Result<UploadReceipt, ClientError>),
    /// Refresh, clear-database and clear-memory all answer with a message.
    Done {
        job: &'static str,
        result: Result<String, ClientError>,
    },
    Files(Result<Vec<FileInfo>, ClientError>),
}

impl DocResult {
    /// Whether this result finishes a job started with [`DocJob::blocks_panel`].
    pub fn unblocks_panel(&self) -> bool {
        !matches!(self, DocResult::Files(_))
    }
}

pub async fn run_doc_job(
    client: ServiceClient,
    job: DocJob,
    tx: Sender<DocResult>,
    repaint: egui::Context,
) {
    let label = job.label();
    let result = match job {
        DocJob::Upload(path) => DocResult::Uploaded(client.upload(&path).await),
        DocJob::Refresh => DocResult::Done {
            job: label,
            result: client.refresh().await.map(|ack| ack.message),
        },
        DocJob::ClearDatabase => DocResult::Done {
            job: label,
            result: client.clear_database().await.map(|ack| ack.message),
        },
        DocJob::ClearMemory => DocResult::Done {
            job: label,
            result: client.clear_memory().await.map(|ack| ack.message),
        },
        DocJob::Search(query) => DocResult::Files(client.search_files(&query).await),
    };
    let _ = tx.send(result);
    repaint.request_repaint();
}

#[derive(Debug)]
pub enum SettingsResult {
    Loaded(Result<ServiceSettings, ClientError>),
    Saved(Result<ServiceSettings, ClientError>),
}

pub async fn load_service_settings(
    client: ServiceClient,
    tx: Sender<SettingsResult>,
    repaint: egui::Context,
) {
    let _ = tx.send(SettingsResult::Loaded(client.settings().await));
    repaint.request_repaint();
}

pub async fn save_service_settings(
    client: ServiceClient,
    update: SettingsUpdate,
    tx: Sender<SettingsResult>,
    repaint: egui::Context,
) {
    let _ = tx.send(SettingsResult::Saved(client.update_settings(&update).await));
    repaint.request_repaint();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Could not listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
