//! Shell state: the chat session, document panel and settings window, plus
//! the channels their background jobs report on.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};

use client::{ChatSession, ServiceClient, TurnId, TurnUpdate};
use futures::future::AbortHandle;
use services::ServiceSupervisor;
use shared::protocol::FileInfo;
use shared::settings::{ServiceSettings, SettingsUpdate, ShellSettings};
use shared::status::{ServiceState, ServiceStatus};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::state::{
    load_service_settings, run_chat_turn, run_doc_job, save_service_settings, DocJob, DocResult,
    SettingsResult,
};

/// The turn currently streaming, if any.
pub struct ActiveTurn {
    pub id: TurnId,
    pub rx: Receiver<(TurnId, TurnUpdate)>,
    pub abort: AbortHandle,
}

#[derive(Default)]
pub struct DocumentPanel {
    pub files: Vec<FileInfo>,
    pub query: String,
    /// Label of the job in flight.
    pub busy: Option<&'static str>,
    pub last_message: Option<String>,
    pub confirm_clear: bool,
}

#[derive(Default)]
pub struct SettingsWindow {
    pub open: bool,
    pub loading: bool,
    pub saving: bool,
    /// What the service last reported; edits are diffed against it.
    pub current: Option<ServiceSettings>,
    pub draft: ServiceSettings,
    pub idle_timeout_secs: String,
}

pub struct AppState {
    pub settings: ShellSettings,
    pub supervisor: ServiceSupervisor,
    pub runtime: Handle,
    pub status_rx: watch::Receiver<ServiceStatus>,
    pub session: ChatSession,
    pub input_text: String,
    pub turn: Option<ActiveTurn>,
    pub docs: DocumentPanel,
    pub settings_window: SettingsWindow,
    doc_tx: Sender<DocResult>,
    doc_rx: Receiver<DocResult>,
    settings_tx: Sender<SettingsResult>,
    settings_rx: Receiver<SettingsResult>,
    repaint: egui::Context,
    last_state: ServiceState,
}

impl AppState {
    pub fn new(
        settings: ShellSettings,
        supervisor: ServiceSupervisor,
        runtime: Handle,
        repaint: egui::Context,
    ) -> Self {
        let (doc_tx, doc_rx) = channel();
        let (settings_tx, settings_rx) = channel();
        let status_rx = supervisor.subscribe();
        Self {
            settings,
            supervisor,
            runtime,
            status_rx,
            session: ChatSession::new(),
            input_text: String::new(),
            turn: None,
            docs: DocumentPanel::default(),
            settings_window: SettingsWindow::default(),
            doc_tx,
            doc_rx,
            settings_tx,
            settings_rx,
            repaint,
            last_state: ServiceState::NotStarted,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status_rx.borrow().clone()
    }

    /// A client for the current address, or `None` while the service is not ready.
    pub fn client(&self) -> Option<ServiceClient> {
        let base = self.status().base_url()?;
        Some(ServiceClient::new(&base).with_idle_timeout(self.settings.stream_idle_timeout()))
    }

    pub fn can_send(&self) -> bool {
        !self.session.is_streaming()
            && self.status().is_ready()
            && !self.input_text.trim().is_empty()
    }

    // ---- polling ---------------------------------------------------------

    pub fn poll(&mut self) {
        self.poll_turn();
        self.poll_documents();
        self.poll_settings();

        let status = self.status();
        if status.state != self.last_state {
            let previous = std::mem::replace(&mut self.last_state, status.state);
            self.on_status_change(previous, &status);
        }
    }

    fn poll_turn(&mut self) {
        let Some(active) = &self.turn else {
            return;
        };
        let mut closed = false;
        loop {
            match active.rx.try_recv() {
                Ok((id, update)) => {
                    if self.session.apply(id, update).is_some() {
                        closed = true;
                        break;
                    }
                }
                Err(std::sync::mpsc::TryRecvError::Empty) => break,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                    // The task ended without a closing update (aborted or panicked).
                    self.session.cancel_turn();
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            self.turn = None;
        }
    }

    fn poll_documents(&mut self) {
        while let Ok(result) = self.doc_rx.try_recv() {
            if result.unblocks_panel() {
                self.docs.busy = None;
            }
            match result {
                DocResult::Uploaded(Ok(receipt)) => {
                    let summary = match &receipt.details {
                        Some(d) => format!(
                            "{} ({} chunks)",
                            receipt.message, d.chunks_created
                        ),
                        None => receipt.message.clone(),
                    };
                    self.docs.last_message = Some(summary);
                    self.run_doc(DocJob::Search(self.docs.query.clone()));
                }
                DocResult::Done {
                    job,
                    result: Ok(message),
                } => {
                    tracing::info!("{} finished: {}", job, message);
                    self.docs.last_message = Some(message);
                    self.run_doc(DocJob::Search(self.docs.query.clone()));
                }
                DocResult::Files(Ok(files)) => self.docs.files = files,
                DocResult::Uploaded(Err(e))
                | DocResult::Done { result: Err(e), .. }
                | DocResult::Files(Err(e)) => {
                    tracing::warn!("Document operation failed: {}", e);
                    self.session.notify(e.to_string(), None);
                }
            }
        }
    }

    fn poll_settings(&mut self) {
        while let Ok(result) = self.settings_rx.try_recv() {
            match result {
                SettingsResult::Loaded(Ok(settings)) | SettingsResult::Saved(Ok(settings)) => {
                    self.settings_window.loading = false;
                    self.settings_window.saving = false;
                    self.settings_window.draft = settings.clone();
                    self.settings_window.current = Some(settings);
                }
                SettingsResult::Loaded(Err(e)) | SettingsResult::Saved(Err(e)) => {
                    self.settings_window.loading = false;
                    self.settings_window.saving = false;
                    self.session
                        .notify("Could not reach the service settings", Some(e.to_string()));
                }
            }
        }
    }

    // ---- chat ------------------------------------------------------------

    pub fn send_message(&mut self) {
        let Some(client) = self.client() else {
            self.session.notify("The service is not ready yet.", None);
            return;
        };
        let text = self.input_text.trim().to_string();
        let turn = match self.session.begin_turn(&text) {
            Ok(turn) => turn,
            Err(e) => {
                tracing::debug!("Not sending: {}", e);
                return;
            }
        };
        self.input_text.clear();

        let (tx, rx) = channel();
        let (abort, abort_reg) = AbortHandle::new_pair();
        self.turn = Some(ActiveTurn { id: turn, rx, abort });
        self.runtime.spawn(run_chat_turn(
            client,
            text,
            turn,
            tx,
            self.repaint.clone(),
            abort_reg,
        ));
    }

    /// Stop reading the current answer. The service may keep generating;
    /// its output is dropped.
    pub fn stop_generation(&mut self) {
        if let Some(active) = self.turn.take() {
            active.abort.abort();
            self.session.cancel_turn();
        }
    }

    /// Clear the visible conversation and the service's memory of it.
    pub fn new_conversation(&mut self) {
        self.stop_generation();
        self.session.clear();
        if self.status().is_ready() {
            self.run_doc(DocJob::ClearMemory);
        }
    }

    // ---- documents -------------------------------------------------------

    pub fn run_doc(&mut self, job: DocJob) {
        let Some(client) = self.client() else {
            self.session.notify("The service is not ready yet.", None);
            return;
        };
        if job.blocks_panel() {
            self.docs.busy = Some(job.label());
        }
        self.runtime.spawn(run_doc_job(
            client,
            job,
            self.doc_tx.clone(),
            self.repaint.clone(),
        ));
    }

    pub fn upload(&mut self, path: PathBuf) {
        self.run_doc(DocJob::Upload(path));
    }

    pub fn open_file(&mut self, name: &str) {
        let Some(client) = self.client() else {
            return;
        };
        let url = client.file_url(name);
        if let Err(e) = open::that(&url) {
            self.session
                .notify(format!("Could not open {}", name), Some(e.to_string()));
        }
    }

    // ---- service ---------------------------------------------------------

    pub fn restart_service(&mut self) {
        self.stop_generation();
        let supervisor = self.supervisor.clone();
        self.runtime.spawn(async move {
            supervisor.stop().await;
            if let Err(e) = supervisor.start().await {
                tracing::error!("Restart failed: {}", e);
            }
        });
    }

    fn on_status_change(&mut self, previous: ServiceState, status: &ServiceStatus) {
        tracing::debug!("Shell saw service {} -> {}", previous, status.state);
        if status.is_ready() {
            self.run_doc(DocJob::Search(self.docs.query.clone()));
        }
    }

    // ---- settings --------------------------------------------------------

    pub fn open_settings(&mut self) {
        let w = &mut self.settings_window;
        w.open = true;
        w.idle_timeout_secs = self
            .settings
            .stream_idle_timeout_secs
            .map(|s| s.to_string())
            .unwrap_or_default();
        let Some(client) = self.client() else {
            return;
        };
        self.settings_window.loading = true;
        self.runtime.spawn(load_service_settings(
            client,
            self.settings_tx.clone(),
            self.repaint.clone(),
        ));
    }

    pub fn save_settings(&mut self) {
        let timeout = self.settings_window.idle_timeout_secs.trim();
        self.settings.stream_idle_timeout_secs = match timeout {
            "" | "0" => None,
            value => match value.parse::<u64>() {
                Ok(secs) => Some(secs),
                Err(_) => {
                    self.session
                        .notify(format!("\"{}\" is not a number of seconds", value), None);
                    return;
                }
            },
        };
        crate::utils::save_settings(&self.settings);

        let Some(current) = &self.settings_window.current else {
            return;
        };
        let update = SettingsUpdate::diff(current, &self.settings_window.draft);
        if update.is_empty() {
            return;
        }
        let Some(client) = self.client() else {
            self.session.notify("The service is not ready yet.", None);
            return;
        };
        self.settings_window.saving = true;
        self.runtime.spawn(save_service_settings(
            client,
            update,
            self.settings_tx.clone(),
            self.repaint.clone(),
        ));
    }
}
