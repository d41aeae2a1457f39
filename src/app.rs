use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use eframe::{
    App, CreationContext, Frame,
    egui::{self, Context, Key, Layout},
};
use egui_extras::{Column, TableBuilder};
use tracing::{info, warn};

use crate::{
    actions::Shortcut,
    controller::Controller,
    domain::{Item, ItemId, Section},
    live::SnapshotSection,
    overview::{FileTransport, OverviewExporter},
    presenter::{ListState, RowAction, Visibility, row_actions},
    storage::{DataDir, Settings, UiState},
    store::MemoryStore,
    sync::CacheSync,
};

pub const APP_NAME: &str = "Trailer";

const COMPANION_DIR: &str = "companion";

pub struct TrailerApp {
    controller: Option<Controller<CacheSync, FileTransport>>,
    data_dir: Option<DataDir>,
    filter_input: String,
    saved_ui: UiState,
    storage_warning: Option<String>,
    title: String,
}

impl TrailerApp {
    pub fn new(_cc: &CreationContext<'_>) -> Self {
        let mut app = Self {
            controller: None,
            data_dir: None,
            filter_input: String::new(),
            saved_ui: UiState::default(),
            storage_warning: None,
            title: APP_NAME.to_owned(),
        };

        let data_dir = match DataDir::initialize() {
            Ok(dir) => dir,
            Err(err) => {
                app.storage_warning = Some(format!("Local data directory is unavailable ({err})."));
                return app;
            }
        };

        let settings = match data_dir.load_settings() {
            Ok(settings) => {
                // Write back so a first run leaves an editable settings file.
                if let Err(err) = data_dir.save_settings(&settings) {
                    warn!(error = %err, "failed to save settings");
                }
                settings
            }
            Err(err) => {
                app.storage_warning =
                    Some(format!("Failed to read settings, using defaults: {err}"));
                Settings::default()
            }
        };
        let ui = data_dir.load_ui_state().unwrap_or_else(|err| {
            warn!(error = %err, "ui state unreadable; starting fresh");
            UiState::default()
        });

        let store = Arc::new(MemoryStore::new());
        let sync = CacheSync::new(store.clone(), data_dir.items_cache_path());
        let exporter = OverviewExporter::new(
            FileTransport::new(data_dir.root().join(COMPANION_DIR)),
            data_dir.overview_path(),
        );
        info!(root = %data_dir.root().display(), "data directory ready");

        app.filter_input = ui.filter_text.clone();
        app.saved_ui = ui.clone();
        app.controller = Some(Controller::new(store, sync, exporter, settings, ui));
        app.data_dir = Some(data_dir);
        app
    }

    fn persist_ui_state(&mut self) {
        let (Some(controller), Some(data_dir)) = (&self.controller, &self.data_dir) else {
            return;
        };
        let state = controller.ui_state();
        if state == self.saved_ui {
            return;
        }
        match data_dir.save_ui_state(&state) {
            Ok(()) => self.saved_ui = state,
            Err(err) => {
                warn!(error = %err, "failed to save ui state");
                self.storage_warning = Some(format!("Failed to save window state: {err}"));
            }
        }
    }
}

impl App for TrailerApp {
    fn update(&mut self, ctx: &Context, _frame: &mut Frame) {
        let Some(controller) = self.controller.as_mut() else {
            egui::CentralPanel::default().show(ctx, |ui| {
                if let Some(warning) = &self.storage_warning {
                    ui.colored_label(ui.visuals().error_fg_color, warning);
                }
            });
            return;
        };

        let now = Instant::now();
        let focused = ctx.input(|i| i.focused);
        controller.set_visibility(if focused {
            Visibility::Foreground
        } else {
            Visibility::Background
        });
        controller.tick(now);
        handle_keys(ctx, controller);

        let mut actions = Vec::new();

        egui::TopBottomPanel::top("tabs_panel").show(ctx, |ui| {
            render_tabs(ui, controller, &mut actions);
            ui.horizontal(|row| {
                let response = row.add(
                    egui::TextEdit::singleline(&mut self.filter_input)
                        .hint_text("Filter…")
                        .desired_width(240.0),
                );
                if response.changed() {
                    actions.push(UiAction::Filter(self.filter_input.clone()));
                }
                row.with_layout(Layout::right_to_left(egui::Align::Center), |lane| {
                    if lane
                        .add_enabled(!controller.is_refreshing(), egui::Button::new("Refresh"))
                        .clicked()
                    {
                        actions.push(UiAction::Refresh);
                    }
                    if lane.button("Mark all as read").clicked() {
                        actions.push(UiAction::MarkAllRead);
                    }
                });
            });
        });

        egui::TopBottomPanel::bottom("status_panel").show(ctx, |ui| {
            if let Some(warning) = &self.storage_warning {
                ui.colored_label(ui.visuals().warn_fg_color, warning);
            }
            match controller.status() {
                Some(status) => ui.small(status),
                None => ui.small(""),
            };
        });

        let detail = controller
            .detail()
            .and_then(|id| controller.live().item(id))
            .cloned();
        controller.set_detail_visible(detail.is_some());
        if let Some(item) = &detail {
            egui::SidePanel::right("detail_panel")
                .default_width(320.0)
                .show(ctx, |ui| render_detail(ui, item, &mut actions));
        }

        egui::CentralPanel::default().show(ctx, |ui| render_list(ui, controller, &mut actions));

        render_dialogs(ctx, controller, &mut actions);

        for action in actions {
            apply_action(controller, action, now);
        }
        for url in controller.take_urls_to_open() {
            ctx.open_url(egui::OpenUrl::new_tab(url));
        }

        let title = controller.title();
        if title != self.title {
            ctx.send_viewport_cmd(egui::ViewportCommand::Title(title.clone()));
            self.title = title;
        }

        self.persist_ui_state();
        ctx.request_repaint_after(Duration::from_millis(250));
    }
}

// -----------------------------------------------------------------------------
// Input
// -----------------------------------------------------------------------------

enum UiAction {
    SelectTab(usize),
    Filter(String),
    Select(ItemId),
    Open(ItemId),
    Row(RowAction, ItemId),
    RemoveAll(Section),
    MarkAllRead,
    Refresh,
    Confirm(bool),
    Snooze(Option<usize>),
    DismissAlert,
    CloseDetail,
}

fn apply_action(
    controller: &mut Controller<CacheSync, FileTransport>,
    action: UiAction,
    now: Instant,
) {
    match action {
        UiAction::SelectTab(index) => controller.select_tab(index),
        UiAction::Filter(text) => controller.set_filter_text(&text, now),
        UiAction::Select(id) => controller.select_item(Some(id)),
        UiAction::Open(id) => controller.open(&id, false),
        UiAction::Row(action, id) => controller.row_action(action, &id),
        UiAction::RemoveAll(section) => controller.remove_all(section),
        UiAction::MarkAllRead => controller.mark_all_read(),
        UiAction::Refresh => controller.refresh(),
        UiAction::Confirm(accepted) => controller.confirm(accepted),
        UiAction::Snooze(choice) => controller.choose_snooze(choice),
        UiAction::DismissAlert => controller.dismiss_alert(),
        UiAction::CloseDetail => controller.set_detail_visible(false),
    }
}

fn handle_keys(ctx: &Context, controller: &mut Controller<CacheSync, FileTransport>) {
    if ctx.wants_keyboard_input() {
        return;
    }
    let (modifiers, pressed) = ctx.input(|i| {
        let keys = [
            Key::ArrowDown,
            Key::ArrowUp,
            Key::ArrowLeft,
            Key::ArrowRight,
            Key::Enter,
            Key::R,
            Key::M,
            Key::S,
        ];
        let pressed: Vec<Key> = keys.into_iter().filter(|key| i.key_pressed(*key)).collect();
        (i.modifiers, pressed)
    });

    for key in pressed {
        match key {
            Key::ArrowDown if modifiers.alt => controller.select_next_section(),
            Key::ArrowUp if modifiers.alt => controller.select_previous_section(),
            Key::ArrowDown => controller.select_next_row(),
            Key::ArrowUp => controller.select_previous_row(),
            Key::ArrowRight if modifiers.command => controller.next_tab(),
            Key::ArrowLeft if modifiers.command => controller.previous_tab(),
            Key::Enter => controller.open_selected(modifiers.command),
            Key::R if modifiers.command => controller.shortcut(Shortcut::ToggleRead),
            Key::M if modifiers.command => controller.shortcut(Shortcut::ToggleMute),
            Key::S if modifiers.command => controller.shortcut(Shortcut::ToggleSnooze),
            _ => {}
        }
    }
}

// -----------------------------------------------------------------------------
// Rendering
// -----------------------------------------------------------------------------

fn render_tabs(
    ui: &mut egui::Ui,
    controller: &Controller<CacheSync, FileTransport>,
    actions: &mut Vec<UiAction>,
) {
    let tabs = controller.tabs();
    if tabs.tabs_hidden() {
        return;
    }
    ui.horizontal_wrapped(|row| {
        for (index, tab) in tabs.tabs().iter().enumerate() {
            let label = match tab.badge_label() {
                Some(badge) => format!("{} ({badge})", tab.title()),
                None => tab.title(),
            };
            let selected = tabs.selected_index() == Some(index);
            if row.selectable_label(selected, label).clicked() {
                actions.push(UiAction::SelectTab(index));
            }
        }
    });
    ui.separator();
}

fn render_list(
    ui: &mut egui::Ui,
    controller: &Controller<CacheSync, FileTransport>,
    actions: &mut Vec<UiAction>,
) {
    if controller.tabs().show_empty() {
        ui.centered_and_justified(|center| {
            center.weak("Nothing to show yet. Refresh to load items.");
        });
        return;
    }

    let presenter = controller.presenter();
    match presenter.state() {
        ListState::Failed { message } => {
            ui.colored_label(ui.visuals().error_fg_color, message);
            return;
        }
        ListState::Empty { reason } => {
            ui.centered_and_justified(|center| {
                center.weak(reason);
            });
            return;
        }
        ListState::Rows => {}
    }

    let show_comments_everywhere = controller.settings().show_comments_everywhere;
    egui::ScrollArea::vertical().show(ui, |area| {
        for (index, section) in presenter.sections().iter().enumerate() {
            if section.rows.is_empty() {
                continue;
            }
            area.push_id(index, |ui| {
                if let Some(header) = presenter.header(index) {
                    ui.horizontal(|row| {
                        row.strong(header.title);
                        if let Some(section) = header.remove_all {
                            row.with_layout(Layout::right_to_left(egui::Align::Center), |lane| {
                                if lane.small_button("Remove all").clicked() {
                                    actions.push(UiAction::RemoveAll(section));
                                }
                            });
                        }
                    });
                }
                draw_rows(
                    ui,
                    section,
                    controller,
                    show_comments_everywhere,
                    actions,
                );
            });
            area.add_space(8.0);
        }
    });
}

fn draw_rows(
    ui: &mut egui::Ui,
    section: &SnapshotSection,
    controller: &Controller<CacheSync, FileTransport>,
    show_comments_everywhere: bool,
    actions: &mut Vec<UiAction>,
) {
    let selected = controller.presenter().selected();
    let rows: Vec<&Item> = section
        .rows
        .iter()
        .filter_map(|id| controller.live().item(id))
        .collect();

    TableBuilder::new(ui)
        .striped(true)
        .vscroll(false)
        .column(Column::remainder())
        .column(Column::initial(130.0))
        .column(Column::initial(200.0))
        .body(|mut body| {
            for item in rows {
                body.row(36.0, |mut row| {
                    row.col(|ui| {
                        let title = if item.counts_as_unread() {
                            format!("● {}", item.title)
                        } else {
                            item.title.clone()
                        };
                        let response = ui.selectable_label(selected == Some(&item.id), title);
                        if response.double_clicked() {
                            actions.push(UiAction::Open(item.id.clone()));
                        } else if response.clicked() {
                            actions.push(UiAction::Select(item.id.clone()));
                        }
                        ui.small(item.subtitle());
                    });
                    row.col(|ui| {
                        ui.label(item.updated_at.format("%Y-%m-%d %H:%M").to_string());
                        let unread = item.unread_comments();
                        if unread > 0 {
                            ui.small(format!("{unread} new"));
                        }
                    });
                    row.col(|ui| {
                        ui.horizontal(|lane| {
                            for action in
                                row_actions(item, section.section, show_comments_everywhere)
                            {
                                if lane.small_button(action.title()).clicked() {
                                    actions.push(UiAction::Row(action, item.id.clone()));
                                }
                            }
                        });
                    });
                });
            }
        });
}

fn render_detail(ui: &mut egui::Ui, item: &Item, actions: &mut Vec<UiAction>) {
    ui.horizontal(|row| {
        row.heading(format!("#{} {}", item.number, item.title));
        row.with_layout(Layout::right_to_left(egui::Align::Center), |lane| {
            if lane.small_button("Close").clicked() {
                actions.push(UiAction::CloseDetail);
            }
        });
    });
    ui.label(item.subtitle());
    if let Some(url) = &item.web_url {
        ui.hyperlink_to("Open in browser", url);
    }
    ui.separator();
    egui::ScrollArea::vertical().show(ui, |area| {
        area.label(&item.body);
        area.separator();
        for comment in item.comments.iter().rev() {
            area.group(|group| {
                group.strong(&comment.author);
                group.small(comment.created_at.format("%Y-%m-%d %H:%M").to_string());
                group.label(&comment.body);
            });
        }
    });
}

fn render_dialogs(
    ctx: &Context,
    controller: &Controller<CacheSync, FileTransport>,
    actions: &mut Vec<UiAction>,
) {
    if let Some(confirmation) = controller.confirmation() {
        egui::Window::new(confirmation.title.as_str())
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label(&confirmation.message);
                ui.horizontal(|row| {
                    if row.button("Cancel").clicked() {
                        actions.push(UiAction::Confirm(false));
                    }
                    if row.button("OK").clicked() {
                        actions.push(UiAction::Confirm(true));
                    }
                });
            });
    }

    if let Some((_, choices)) = controller.snooze_choice() {
        egui::Window::new("Snooze")
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                for (index, choice) in choices.iter().enumerate() {
                    if ui.button(choice).clicked() {
                        actions.push(UiAction::Snooze(Some(index)));
                    }
                }
                if ui.button("Cancel").clicked() {
                    actions.push(UiAction::Snooze(None));
                }
            });
    }

    if let Some((title, message)) = controller.alert() {
        egui::Window::new(title.as_str())
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label(message);
                if ui.button("OK").clicked() {
                    actions.push(UiAction::DismissAlert);
                }
            });
    }
}
