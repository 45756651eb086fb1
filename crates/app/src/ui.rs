//! egui rendering for the shell panels.

use eframe::egui;
use shared::protocol::{ChatMessage, Role};
use shared::status::{ServiceState, ServiceStatus};

use crate::state::DocJob;
use crate::types::AppState;
use crate::utils::format_size;

fn state_color(state: ServiceState, dark: bool) -> egui::Color32 {
    match state {
        ServiceState::Ready => egui::Color32::from_rgb(90, 170, 110),
        ServiceState::Starting | ServiceState::Probing | ServiceState::Restarting => {
            egui::Color32::from_rgb(210, 170, 70)
        }
        ServiceState::Crashed | ServiceState::Failed => egui::Color32::from_rgb(200, 80, 80),
        ServiceState::NotStarted | ServiceState::Stopped => {
            if dark {
                egui::Color32::from_rgb(150, 150, 160)
            } else {
                egui::Color32::from_rgb(110, 110, 120)
            }
        }
    }
}

fn status_text(status: &ServiceStatus) -> String {
    let mut text = match status.state {
        ServiceState::Ready => match status.address {
            Some(addr) => format!("Ready on {}", addr),
            None => "Ready".to_string(),
        },
        ServiceState::NotStarted => "Not started".to_string(),
        ServiceState::Starting => "Starting service".to_string(),
        ServiceState::Probing => "Waiting for service".to_string(),
        ServiceState::Crashed => "Service crashed".to_string(),
        ServiceState::Restarting => "Restarting service".to_string(),
        ServiceState::Stopped => "Service stopped".to_string(),
        ServiceState::Failed => "Service unavailable".to_string(),
    };
    if status.restart_count > 0 {
        text.push_str(&format!(" (restarts: {})", status.restart_count));
    }
    text
}

/// Header: title, service status, restart, new conversation and settings.
pub fn header(ctx: &egui::Context, s: &mut AppState) {
    let dark = s.settings.dark_mode;
    let status = s.status();
    egui::TopBottomPanel::top("header").show(ctx, |ui| {
        ui.add_space(8.0);
        ui.horizontal(|ui| {
            ui.heading("Document Q&A");
            ui.separator();

            let color = state_color(status.state, dark);
            ui.label(egui::RichText::new("●").color(color));
            if matches!(
                status.state,
                ServiceState::Starting | ServiceState::Probing | ServiceState::Restarting
            ) {
                ui.spinner();
            }
            let label = ui.label(status_text(&status));
            if let Some(err) = &status.last_error {
                label.on_hover_text(err);
            }

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if ui.button("Settings").clicked() {
                    s.open_settings();
                }
                let dark_icon = if dark { "☀" } else { "🌙" };
                if ui.button(dark_icon).on_hover_text("Toggle theme").clicked() {
                    s.settings.dark_mode = !dark;
                    crate::utils::save_settings(&s.settings);
                }
                if ui.button("New conversation").clicked() {
                    s.new_conversation();
                }
                if ui.button("Restart service").clicked() {
                    s.restart_service();
                }
            });
        });
        ui.add_space(8.0);
    });
}

/// Notices stack at the bottom of the window until dismissed.
pub fn notices(ctx: &egui::Context, s: &mut AppState) {
    if s.session.notices().is_empty() {
        return;
    }
    let mut dismissed = Vec::new();
    egui::TopBottomPanel::bottom("notices").show(ctx, |ui| {
        for notice in s.session.notices() {
            egui::Frame::none()
                .fill(egui::Color32::from_rgb(120, 45, 45))
                .rounding(egui::Rounding::same(6.0))
                .inner_margin(egui::Margin::same(8.0))
                .show(ui, |ui| {
                    ui.horizontal(|ui| {
                        let label = ui.label(
                            egui::RichText::new(&notice.message).color(egui::Color32::WHITE),
                        );
                        if let Some(detail) = &notice.detail {
                            label.on_hover_text(detail);
                        }
                        ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                            if ui.small_button("✕").clicked() {
                                dismissed.push(notice.id);
                            }
                        });
                    });
                });
            ui.add_space(4.0);
        }
    });
    for id in dismissed {
        s.session.dismiss(id);
    }
}

/// Left panel: upload, refresh, clear, and the searchable file list.
pub fn documents(ctx: &egui::Context, s: &mut AppState) {
    let ready = s.status().is_ready();
    egui::SidePanel::left("documents")
        .resizable(true)
        .default_width(260.0)
        .show(ctx, |ui| {
            ui.add_space(8.0);
            ui.heading("Documents");
            ui.add_space(4.0);

            let idle = s.docs.busy.is_none();
            ui.horizontal_wrapped(|ui| {
                if ui.add_enabled(ready && idle, egui::Button::new("Upload…")).clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .set_title("Add a document")
                        .add_filter("Documents", &["pdf", "txt", "md", "docx"])
                        .pick_file()
                    {
                        s.upload(path);
                    }
                }
                if ui.add_enabled(ready && idle, egui::Button::new("Refresh")).clicked() {
                    s.run_doc(DocJob::Refresh);
                }
                if ui
                    .add_enabled(ready && idle, egui::Button::new("Clear database"))
                    .clicked()
                {
                    s.docs.confirm_clear = true;
                }
                if ui
                    .add_enabled(ready && idle, egui::Button::new("Clear memory"))
                    .on_hover_text("Forget the conversation on the service side")
                    .clicked()
                {
                    s.run_doc(DocJob::ClearMemory);
                }
            });

            if s.docs.confirm_clear {
                ui.horizontal(|ui| {
                    ui.label("Delete all indexed documents?");
                    if ui.button("Yes").clicked() {
                        s.docs.confirm_clear = false;
                        s.run_doc(DocJob::ClearDatabase);
                    }
                    if ui.button("No").clicked() {
                        s.docs.confirm_clear = false;
                    }
                });
            }

            if let Some(busy) = s.docs.busy {
                ui.horizontal(|ui| {
                    ui.spinner();
                    ui.label(format!("{}…", busy));
                });
            } else if let Some(msg) = &s.docs.last_message {
                ui.label(egui::RichText::new(msg).small().weak());
            }

            ui.separator();
            let search = ui.add(
                egui::TextEdit::singleline(&mut s.docs.query).hint_text("Search files"),
            );
            if search.changed() && ready {
                let query = s.docs.query.clone();
                s.run_doc(DocJob::Search(query));
            }

            let mut clicked = None;
            egui::ScrollArea::vertical()
                .auto_shrink([false, false])
                .show(ui, |ui| {
                    if s.docs.files.is_empty() {
                        ui.label(egui::RichText::new("No documents yet").weak());
                    }
                    for file in &s.docs.files {
                        ui.horizontal(|ui| {
                            if ui.link(&file.name).clicked() {
                                clicked = Some(file.name.clone());
                            }
                            ui.label(
                                egui::RichText::new(format!(
                                    "{} · {}",
                                    file.kind,
                                    format_size(file.size)
                                ))
                                .small()
                                .weak(),
                            );
                        });
                    }
                });
            if let Some(name) = clicked {
                s.open_file(&name);
            }
        });
}

fn message_bubble(ui: &mut egui::Ui, msg: &ChatMessage, dark: bool) -> Option<String> {
    let (fill, align) = match (msg.role, dark) {
        (Role::User, true) => (egui::Color32::from_rgb(45, 70, 100), egui::Align::Max),
        (Role::User, false) => (egui::Color32::from_rgb(215, 230, 245), egui::Align::Max),
        (Role::Assistant, true) => (egui::Color32::from_rgb(50, 50, 58), egui::Align::Min),
        (Role::Assistant, false) => (egui::Color32::from_rgb(235, 235, 240), egui::Align::Min),
    };
    let mut clicked = None;
    ui.with_layout(egui::Layout::top_down(align), |ui| {
        egui::Frame::none()
            .fill(fill)
            .rounding(egui::Rounding::same(12.0))
            .inner_margin(egui::Margin::same(12.0))
            .show(ui, |ui| {
                ui.set_max_width(ui.available_width() * 0.8);
                if msg.is_thinking && msg.content.is_empty() {
                    ui.horizontal(|ui| {
                        ui.spinner();
                        ui.label(egui::RichText::new("Thinking").italics());
                    });
                } else {
                    ui.label(&msg.content);
                }
                if let Some(sources) = msg.sources.as_ref().filter(|s| !s.is_empty()) {
                    ui.add_space(6.0);
                    ui.horizontal_wrapped(|ui| {
                        ui.label(egui::RichText::new("Sources:").small().weak());
                        for source in sources {
                            let text = match source.page {
                                Some(page) => format!("{} (p. {})", source.name, page),
                                None => source.name.clone(),
                            };
                            if ui
                                .link(egui::RichText::new(text).small())
                                .on_hover_text(&source.locator)
                                .clicked()
                            {
                                clicked = Some(source.name.clone());
                            }
                        }
                    });
                }
                ui.label(egui::RichText::new(&msg.timestamp).small().weak());
            });
    });
    clicked
}

/// Chat history and the input row.
pub fn chat(ctx: &egui::Context, s: &mut AppState) {
    let dark = s.settings.dark_mode;
    egui::CentralPanel::default().show(ctx, |ui| {
        let input_height = 56.0;
        let chat_height = (ui.available_height() - input_height).max(100.0);

        let mut clicked = None;
        egui::ScrollArea::vertical()
            .max_height(chat_height)
            .auto_shrink([false, false])
            .stick_to_bottom(true)
            .show(ui, |ui| {
                if s.session.messages().is_empty() {
                    ui.add_space(24.0);
                    ui.vertical_centered(|ui| {
                        ui.label(
                            egui::RichText::new("Ask a question about your documents.").weak(),
                        );
                    });
                }
                for msg in s.session.messages() {
                    ui.add_space(6.0);
                    if let Some(name) = message_bubble(ui, msg, dark) {
                        clicked = Some(name);
                    }
                }
            });
        if let Some(name) = clicked {
            s.open_file(&name);
        }

        ui.separator();
        ui.horizontal(|ui| {
            let streaming = s.session.is_streaming();
            let hint = if s.status().is_ready() {
                "Ask about your documents"
            } else {
                "Waiting for the service…"
            };
            let response = ui.add_sized(
                [ui.available_width() - 80.0, 40.0],
                egui::TextEdit::singleline(&mut s.input_text)
                    .hint_text(hint)
                    .font(egui::FontId::new(15.0, egui::FontFamily::Proportional)),
            );
            if response.lost_focus()
                && ui.input(|i| i.key_pressed(egui::Key::Enter))
                && s.can_send()
            {
                s.send_message();
                response.request_focus();
            }

            if streaming {
                let stop = egui::Button::new("Stop").fill(egui::Color32::from_rgb(180, 80, 80));
                if ui.add_sized([70.0, 40.0], stop).clicked() {
                    s.stop_generation();
                }
            } else {
                let send = egui::Button::new("Send").fill(egui::Color32::from_rgb(70, 130, 180));
                let clicked = ui
                    .add_enabled_ui(s.can_send(), |ui| ui.add_sized([70.0, 40.0], send))
                    .inner
                    .clicked();
                if clicked {
                    s.send_message();
                }
            }
        });
    });
}

/// Service retrieval settings plus the shell's own stream timeout.
pub fn settings_window(ctx: &egui::Context, s: &mut AppState) {
    if !s.settings_window.open {
        return;
    }
    let mut open = true;
    let mut save = false;
    egui::Window::new("Settings")
        .collapsible(false)
        .resizable(false)
        .open(&mut open)
        .show(ctx, |ui| {
            let w = &mut s.settings_window;
            if w.loading {
                ui.horizontal(|ui| {
                    ui.spinner();
                    ui.label("Loading settings…");
                });
            } else if w.current.is_none() {
                ui.label(
                    egui::RichText::new("Service settings are available once the service is ready.")
                        .weak(),
                );
            } else {
                egui::Grid::new("service_settings")
                    .num_columns(2)
                    .spacing([12.0, 6.0])
                    .show(ui, |ui| {
                        ui.label("Ollama URL");
                        ui.text_edit_singleline(&mut w.draft.ollama_base_url);
                        ui.end_row();
                        ui.label("Embedding model");
                        ui.text_edit_singleline(&mut w.draft.embedding_model);
                        ui.end_row();
                        ui.label("Chat model");
                        ui.text_edit_singleline(&mut w.draft.llm_model);
                        ui.end_row();
                        ui.label("Chunk size");
                        ui.add(egui::DragValue::new(&mut w.draft.chunk_size).clamp_range(100..=8000));
                        ui.end_row();
                        ui.label("Chunk overlap");
                        ui.add(egui::DragValue::new(&mut w.draft.chunk_overlap).clamp_range(0..=2000));
                        ui.end_row();
                        ui.label("Chunks per answer");
                        ui.add(egui::DragValue::new(&mut w.draft.top_k_chunks).clamp_range(1..=50));
                        ui.end_row();
                    });
            }

            ui.separator();
            ui.horizontal(|ui| {
                ui.label("Stream idle timeout (s)");
                ui.add(
                    egui::TextEdit::singleline(&mut w.idle_timeout_secs)
                        .hint_text("off")
                        .desired_width(60.0),
                );
            });

            ui.add_space(8.0);
            ui.horizontal(|ui| {
                if ui.add_enabled(!w.saving, egui::Button::new("Save")).clicked() {
                    save = true;
                }
                if w.saving {
                    ui.spinner();
                }
            });
        });
    if save {
        s.save_settings();
    }
    s.settings_window.open = open;
}
