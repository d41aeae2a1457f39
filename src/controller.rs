//! UI-thread reconciliation loop.
//!
//! Store notifications, sync completions, export results and companion
//! requests are all drained here, on the thread that owns the list state,
//! in arrival order.

use std::{
    sync::{Arc, mpsc::Receiver},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    actions::{ActionError, ActionRouter, Confirmation, Outcome, Shortcut},
    domain::{GroupingCriterion, ItemId, ItemKind, Section},
    live::LiveResultSet,
    overview::{
        Command, CompanionRequest, CompanionTransport, ExportContext, ListRequest,
        OverviewExporter, ReplyHandle,
    },
    presenter::{ListPresenter, RowAction, Visibility, window_title},
    query::ItemQuery,
    storage::{Settings, UiState},
    store::{ChangeBatch, ItemSource, ItemStore},
    sync::SyncEngine,
    tabs::TabModel,
};

pub const STORE_CHANGE_DEBOUNCE: Duration = Duration::from_secs(1);
pub const FILTER_DEBOUNCE: Duration = Duration::from_millis(500);
const SNOOZE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const AUTO_REFRESH_INTERVAL_SECS: u64 = 180;

/// Trailing-edge timer: every poke pushes the deadline out again.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    due: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, due: None }
    }

    pub fn poke(&mut self, now: Instant) {
        self.due = Some(now + self.delay);
    }

    /// True once per burst, when the deadline has passed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if due <= now => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct PeriodicTask {
    interval: Duration,
    last_run: Option<Instant>,
}

impl PeriodicTask {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
        }
    }

    fn should_trigger(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(instant) => now.duration_since(instant) >= self.interval,
        }
    }

    fn mark_triggered(&mut self, now: Instant) {
        self.last_run = Some(now);
    }
}

/// A companion refresh request waiting for its sync to finish.
struct AwaitingRefresh {
    since: Option<DateTime<Utc>>,
    list: ListRequest,
    handle: ReplyHandle,
}

pub struct Controller<E: SyncEngine, T: CompanionTransport> {
    store: Arc<dyn ItemStore>,
    changes: Receiver<ChangeBatch>,
    pending_changes: ChangeBatch,
    store_debounce: Debouncer,
    filter_debounce: Debouncer,
    snooze_sweep: PeriodicTask,
    auto_refresh: PeriodicTask,

    settings: Settings,
    ui: UiState,
    tabs: TabModel,
    live: LiveResultSet,
    presenter: ListPresenter,
    visibility: Visibility,

    sync: E,
    refresh_ticket: Option<u64>,
    awaiting_refresh: Vec<AwaitingRefresh>,

    exporter: OverviewExporter<T>,
    peer_reachable: bool,

    confirmation: Option<Confirmation>,
    snooze_choice: Option<(ItemId, Vec<String>)>,
    alert: Option<(String, String)>,
    status: Option<String>,
    urls_to_open: Vec<String>,
    detail: Option<ItemId>,
    detail_visible: bool,
}

impl<E: SyncEngine, T: CompanionTransport> Controller<E, T> {
    pub fn new(
        store: Arc<dyn ItemStore>,
        sync: E,
        exporter: OverviewExporter<T>,
        settings: Settings,
        ui: UiState,
    ) -> Self {
        let changes = store.subscribe();
        let mut controller = Self {
            store,
            changes,
            pending_changes: ChangeBatch::default(),
            store_debounce: Debouncer::new(STORE_CHANGE_DEBOUNCE),
            filter_debounce: Debouncer::new(FILTER_DEBOUNCE),
            snooze_sweep: PeriodicTask::new(SNOOZE_SWEEP_INTERVAL),
            auto_refresh: PeriodicTask::new(Duration::from_secs(AUTO_REFRESH_INTERVAL_SECS)),
            tabs: TabModel::new(ui.last_tab_index),
            live: LiveResultSet::new(ItemQuery::new(ItemKind::PullRequest)),
            presenter: ListPresenter::new(ItemKind::PullRequest),
            visibility: Visibility::Foreground,
            settings,
            ui,
            sync,
            refresh_ticket: None,
            awaiting_refresh: Vec::new(),
            exporter,
            peer_reachable: false,
            confirmation: None,
            snooze_choice: None,
            alert: None,
            status: None,
            urls_to_open: Vec::new(),
            detail: None,
            detail_visible: false,
        };
        controller.rebuild_tabs();
        controller.reconfigure(false);
        controller.presenter.select(controller.ui.selected.clone());
        controller
            .presenter
            .set_scroll_anchor(controller.ui.scroll_anchor.clone());
        controller.export_overview();
        controller
    }

    // ---- accessors ----

    pub fn tabs(&self) -> &TabModel {
        &self.tabs
    }

    pub fn live(&self) -> &LiveResultSet {
        &self.live
    }

    pub fn presenter(&self) -> &ListPresenter {
        &self.presenter
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn confirmation(&self) -> Option<&Confirmation> {
        self.confirmation.as_ref()
    }

    pub fn snooze_choice(&self) -> Option<&(ItemId, Vec<String>)> {
        self.snooze_choice.as_ref()
    }

    pub fn alert(&self) -> Option<&(String, String)> {
        self.alert.as_ref()
    }

    pub fn dismiss_alert(&mut self) {
        self.alert = None;
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn detail(&self) -> Option<&ItemId> {
        self.detail.as_ref()
    }

    pub fn take_urls_to_open(&mut self) -> Vec<String> {
        std::mem::take(&mut self.urls_to_open)
    }

    pub fn is_refreshing(&self) -> bool {
        self.sync.is_refreshing()
    }

    pub fn title(&self) -> String {
        let unread = self
            .live
            .items()
            .filter(|item| item.counts_as_unread())
            .count();
        window_title(
            self.tabs.viewing_kind(),
            self.live.snapshot().row_count(),
            unread,
            self.sync.is_refreshing(),
        )
    }

    /// UI state to persist, with the live selection folded in.
    pub fn ui_state(&self) -> UiState {
        UiState {
            last_tab_index: self.tabs.last_tab_index(),
            filter_text: self.ui.filter_text.clone(),
            selected: self.presenter.selected().cloned(),
            scroll_anchor: self.presenter.scroll_anchor_path().and_then(|path| {
                self.live.snapshot().id_at(path).cloned()
            }),
        }
    }

    // ---- loop ----

    /// One pass of the UI-thread loop.
    pub fn tick(&mut self, now: Instant) {
        while let Ok(batch) = self.changes.try_recv() {
            self.pending_changes.merge(batch);
            self.store_debounce.poke(now);
        }
        if self.store_debounce.fire(now) {
            let batch = std::mem::take(&mut self.pending_changes);
            self.reconcile(&batch);
        }

        if self.filter_debounce.fire(now) {
            self.reconfigure(true);
        }

        self.poll_sync();
        self.exporter.poll();

        let reachable = self.exporter.transport().status().reachable;
        if reachable && !self.peer_reachable {
            self.exporter.on_reachability_change();
        }
        self.peer_reachable = reachable;

        for (message, handle) in self.exporter.transport_mut().exchange() {
            self.handle_companion(message, handle);
        }

        if self.snooze_sweep.should_trigger(now) {
            self.snooze_sweep.mark_triggered(now);
            self.wake_due_items();
        }
        if self.auto_refresh.should_trigger(now) && !self.sync.is_refreshing() {
            self.auto_refresh.mark_triggered(now);
            if self.sync.has_network_connection() {
                self.refresh_ticket = Some(self.sync.start_refresh());
            }
        }
    }

    /// Reconcile one coalesced batch end to end before anything else runs.
    fn reconcile(&mut self, batch: &ChangeBatch) {
        debug!(
            inserted = batch.inserted.len(),
            deleted = batch.deleted.len(),
            updated = batch.updated.len(),
            "reconciling change batch"
        );
        if self.rebuild_tabs() {
            self.reconfigure(false);
        } else {
            match self.live.on_store_change(&*self.store, batch) {
                Ok(events) => {
                    self.presenter
                        .apply(&events, self.live.snapshot(), self.visibility)
                }
                Err(err) => self.presenter.show_failure(err.to_string()),
            }
        }
        self.export_overview();
    }

    /// Rebuild tabs; true when the viewed criterion or kind changed.
    fn rebuild_tabs(&mut self) -> bool {
        let before = self.current_view();
        if let Err(err) = self.tabs.rebuild(&*self.store, self.settings.separate_api_servers) {
            warn!(error = %err, "tab rebuild failed");
        }
        before != self.current_view()
    }

    fn current_view(&self) -> (Option<GroupingCriterion>, Option<ItemKind>) {
        (
            self.tabs.current().and_then(|tab| tab.criterion.clone()),
            self.tabs.viewing_kind(),
        )
    }

    fn query(&self) -> ItemQuery {
        let kind = self.tabs.viewing_kind().unwrap_or(ItemKind::PullRequest);
        let criterion = self.tabs.current().and_then(|tab| tab.criterion.clone());
        ItemQuery::new(kind)
            .with_criterion(criterion)
            .with_filter(&self.ui.filter_text)
            .hiding_uncommented(self.settings.hide_uncommented_items)
            .sorted_by(self.settings.sort, self.settings.sort_descending)
    }

    /// Re-run the query. Tab switches redraw; filter edits animate.
    fn reconfigure(&mut self, animate: bool) {
        let query = self.query();
        self.presenter.set_context(
            query.kind,
            query.filter.text(),
            query.criterion.as_ref(),
        );
        match self.live.configure(&*self.store, query) {
            Ok(events) if animate => {
                self.presenter
                    .apply(&events, self.live.snapshot(), self.visibility)
            }
            Ok(_) => self.presenter.redraw(self.live.snapshot()),
            Err(err) => self.presenter.show_failure(err.to_string()),
        }
    }

    fn export_context(&self) -> Option<ExportContext> {
        match self.store.snapshot() {
            Ok(snapshot) => Some(ExportContext {
                snapshot,
                criteria: self
                    .tabs
                    .descriptors()
                    .iter()
                    .map(|descriptor| descriptor.criterion.clone())
                    .collect(),
                settings: self.settings.clone(),
                last_updated: self.sync.last_successful_refresh(),
            }),
            Err(err) => {
                warn!(error = %err, "store snapshot unavailable for export");
                None
            }
        }
    }

    fn export_overview(&mut self) {
        if let Some(context) = self.export_context() {
            self.exporter.update_context(context);
        }
    }

    fn poll_sync(&mut self) {
        for completion in self.sync.poll() {
            if self.refresh_ticket != Some(completion.ticket) {
                debug!(ticket = completion.ticket, "stale refresh completion ignored");
                continue;
            }
            self.refresh_ticket = None;
            match completion.result {
                Ok(summary) => {
                    self.status = Some(format!(
                        "Refreshed: {} items, {} removed",
                        summary.upserted, summary.removed
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "refresh failed");
                    self.status = Some(format!("Refresh failed: {err}"));
                }
            }
        }

        if self.sync.is_refreshing() || self.awaiting_refresh.is_empty() {
            return;
        }
        let last = self.sync.last_successful_refresh();
        for waiting in std::mem::take(&mut self.awaiting_refresh) {
            let advanced = match (waiting.since, last) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(since), Some(last)) => last > since,
            };
            if !advanced {
                waiting.handle.fail("Refresh Failed");
                continue;
            }
            match self.export_context() {
                Some(context) => self.exporter.answer(waiting.list, context, waiting.handle),
                None => waiting.handle.fail("Refresh Failed"),
            }
        }
    }

    fn wake_due_items(&mut self) {
        let now = Utc::now();
        let snoozing: Vec<ItemId> = match self.store.snapshot() {
            Ok(snapshot) => snapshot
                .all_items()
                .filter(|item| item.is_snoozing())
                .map(|item| item.id.clone())
                .collect(),
            Err(err) => {
                warn!(error = %err, "snooze sweep skipped");
                return;
            }
        };
        if snoozing.is_empty() {
            return;
        }
        match self.store.update_many(&snoozing, &mut |item| {
            item.wake_if_due(now);
        }) {
            Ok(_) => debug!(checked = snoozing.len(), "snooze sweep done"),
            Err(err) => warn!(error = %err, "snooze sweep failed"),
        }
    }

    // ---- user input ----

    pub fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
    }

    pub fn set_detail_visible(&mut self, visible: bool) {
        self.detail_visible = visible;
        if !visible {
            self.detail = None;
        }
    }

    pub fn set_filter_text(&mut self, text: &str, now: Instant) {
        if self.ui.filter_text == text {
            return;
        }
        self.ui.filter_text = text.to_owned();
        self.filter_debounce.poke(now);
    }

    pub fn select_tab(&mut self, index: usize) {
        if self.tabs.select(index).is_some() {
            self.reconfigure(false);
        }
    }

    pub fn next_tab(&mut self) {
        if self.tabs.select_next().is_some() {
            self.reconfigure(false);
        }
    }

    pub fn previous_tab(&mut self) {
        if self.tabs.select_previous().is_some() {
            self.reconfigure(false);
        }
    }

    pub fn select_item(&mut self, id: Option<ItemId>) {
        self.presenter.select(id);
    }

    pub fn select_next_row(&mut self) {
        self.presenter.select_next_row();
    }

    pub fn select_previous_row(&mut self) {
        self.presenter.select_previous_row();
    }

    pub fn select_next_section(&mut self) {
        self.presenter.select_next_section();
    }

    pub fn select_previous_section(&mut self) {
        self.presenter.select_previous_section();
    }

    pub fn set_scroll_anchor(&mut self, id: Option<ItemId>) {
        self.presenter.set_scroll_anchor(id);
    }

    fn router(&self) -> ActionRouter<'_, dyn ItemStore> {
        ActionRouter::new(&*self.store, &self.settings, Utc::now())
    }

    pub fn row_action(&mut self, action: RowAction, id: &ItemId) {
        let result = self.router().row_action(action, id);
        self.handle_outcome(result);
    }

    /// Toggle shortcut on the selected row.
    pub fn shortcut(&mut self, shortcut: Shortcut) {
        let (Some(id), Some(section)) = (
            self.presenter.selected().cloned(),
            self.presenter.selected_section(),
        ) else {
            return;
        };
        let result = self.router().shortcut(shortcut, &id, section);
        self.handle_outcome(result);
    }

    pub fn open(&mut self, id: &ItemId, force_browser: bool) {
        let result = self.router().open(id, force_browser, self.detail_visible);
        self.handle_outcome(result);
    }

    pub fn open_selected(&mut self, force_browser: bool) {
        if let Some(id) = self.presenter.selected().cloned() {
            self.open(&id, force_browser);
        }
    }

    pub fn remove_all(&mut self, section: Section) {
        let Some(tab) = self.tabs.current().cloned() else {
            return;
        };
        let result = self
            .router()
            .remove_all(tab.kind, section, tab.criterion.as_ref(), false);
        self.handle_outcome(result);
    }

    pub fn mark_all_read(&mut self) {
        let Some(tab) = self.tabs.current().cloned() else {
            return;
        };
        let ids: Vec<ItemId> = self.live.items().map(|item| item.id.clone()).collect();
        let result = self
            .router()
            .mark_all_read(&ids, tab.kind, tab.criterion.as_ref(), false);
        self.handle_outcome(result);
    }

    /// Answer the pending confirmation.
    pub fn confirm(&mut self, accepted: bool) {
        let Some(confirmation) = self.confirmation.take() else {
            return;
        };
        if accepted {
            let result = self.router().confirm(&confirmation.action);
            self.handle_outcome(result);
        }
    }

    /// Answer the pending snooze choice; `None` cancels.
    pub fn choose_snooze(&mut self, preset: Option<usize>) {
        let Some((id, _)) = self.snooze_choice.take() else {
            return;
        };
        if let Some(preset) = preset {
            let result = self.router().snooze(&id, Some(preset));
            self.handle_outcome(result);
        }
    }

    pub fn refresh(&mut self) {
        let result =
            ActionRouter::new(&*self.store, &self.settings, Utc::now()).refresh(&mut self.sync);
        self.handle_outcome(result);
    }

    pub fn deep_link(&mut self, reference: &str, action: Option<&str>) {
        let result = self.router().deep_link(reference, action);
        self.handle_outcome(result);
    }

    fn handle_outcome(&mut self, result: Result<Outcome, ActionError>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(error = %err, "action refused");
                self.alert = Some(err.user_message());
                return;
            }
        };
        match outcome {
            Outcome::Done => {}
            Outcome::Removed(count) => {
                self.status = Some(format!("Removed {count} items"));
            }
            Outcome::MarkedRead(count) => {
                self.status = Some(format!("Marked {count} items as read"));
            }
            Outcome::Confirm(confirmation) => self.confirmation = Some(confirmation),
            Outcome::ChooseSnooze { item, choices } => {
                self.snooze_choice = Some((item, choices));
            }
            Outcome::OpenUrl(url) => self.urls_to_open.push(url),
            Outcome::ShowDetail(id) => self.detail = Some(id),
            Outcome::Reveal { item, url } => self.reveal(item, url),
            Outcome::Refreshing(ticket) => {
                info!(ticket, "refresh requested");
                self.refresh_ticket = Some(ticket);
            }
        }
    }

    fn reveal(&mut self, id: ItemId, url: Option<String>) {
        let item = match self.store.item(&id) {
            Ok(Some(item)) => item,
            _ => {
                self.alert = Some(ActionError::ItemNotFound.user_message());
                return;
            }
        };
        if self.tabs.select_for_item(&item).is_some() {
            self.reconfigure(false);
        }
        self.presenter.select(Some(id.clone()));
        match url {
            Some(url) if self.settings.open_items_directly_in_browser && !self.detail_visible => {
                self.urls_to_open.push(url);
            }
            _ => self.detail = Some(id),
        }
    }

    // ---- companion ----

    fn handle_companion(&mut self, message: Value, handle: ReplyHandle) {
        let request = match CompanionRequest::parse(message) {
            Ok(request) => request,
            Err(err) => {
                handle.fail(err.to_string());
                return;
            }
        };
        debug!(command = ?request.command, "companion request");

        let result = match request.command {
            Command::Refresh => {
                let since = self.sync.last_successful_refresh();
                let router = ActionRouter::new(&*self.store, &self.settings, Utc::now());
                match router.refresh(&mut self.sync) {
                    Ok(Outcome::Refreshing(ticket)) => {
                        self.refresh_ticket = Some(ticket);
                        self.awaiting_refresh.push(AwaitingRefresh {
                            since,
                            list: request.list,
                            handle,
                        });
                    }
                    Ok(_) => handle.fail("Refresh Failed"),
                    Err(err) => handle.fail(err.user_message().0),
                }
                return;
            }
            Command::NeedsOverview => {
                self.exporter.send_overview();
                handle.succeed(None);
                return;
            }
            Command::OpenItem(Some(id)) => self.router().deep_link(id.as_str(), None),
            Command::OpenComment(Some(id)) => {
                self.router().deep_link(&format!("comment:{id}"), None)
            }
            Command::ClearAllMerged => self.router().clear_all(Section::Merged),
            Command::ClearAllClosed => self.router().clear_all(Section::Closed),
            Command::MarkEverythingRead => self.router().mark_everything_read(),
            Command::MarkItemsRead(ids) => self.router().mark_items_read(&ids),
            Command::OpenItem(None) | Command::OpenComment(None) | Command::None => {
                Ok(Outcome::Done)
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "companion command failed");
                handle.fail(err.user_message().0);
                return;
            }
        };
        self.handle_outcome(Ok(outcome));

        match self.export_context() {
            Some(context) => self.exporter.answer(request.list, context, handle),
            None => handle.fail("Store unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, thread};

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::{
        domain::{ApiServer, Item, ItemCondition, Repo, fixtures::*},
        overview::{CompanionResponse, FileTransport},
        presenter::Redraw,
        query::FetchedSection,
        store::{MemoryStore, StoreError, StoreSnapshot, badge_count},
        sync::{RefreshCompletion, SyncSummary},
    };

    /// Sync double: a refresh completes on the next poll.
    #[derive(Default)]
    struct ScriptedSync {
        offline: bool,
        advance: bool,
        /// Report the ticket before the running one, as a superseded job would.
        superseded: bool,
        next_ticket: u64,
        running: Option<u64>,
        last: Option<DateTime<Utc>>,
    }

    impl SyncEngine for ScriptedSync {
        fn has_network_connection(&self) -> bool {
            !self.offline
        }

        fn start_refresh(&mut self) -> u64 {
            self.next_ticket += 1;
            self.running = Some(self.next_ticket);
            self.next_ticket
        }

        fn is_refreshing(&self) -> bool {
            self.running.is_some()
        }

        fn last_successful_refresh(&self) -> Option<DateTime<Utc>> {
            self.last
        }

        fn poll(&mut self) -> Vec<RefreshCompletion> {
            let Some(ticket) = self.running.take() else {
                return Vec::new();
            };
            if self.advance {
                self.last = Some(self.last.map_or(at(1), |last| last + chrono::Duration::hours(1)));
            }
            let ticket = if self.superseded { ticket - 1 } else { ticket };
            vec![RefreshCompletion {
                ticket,
                result: Ok(SyncSummary {
                    upserted: 1,
                    removed: 0,
                }),
            }]
        }
    }

    /// Store whose deletes always fail.
    struct FailingDeletes(MemoryStore);

    impl ItemSource for FailingDeletes {
        fn fetch(&self, query: &ItemQuery) -> Result<Vec<FetchedSection>, StoreError> {
            self.0.fetch(query)
        }

        fn item(&self, id: &ItemId) -> Result<Option<Item>, StoreError> {
            self.0.item(id)
        }

        fn comment_parent(&self, comment_id: &str) -> Result<Option<Item>, StoreError> {
            self.0.comment_parent(comment_id)
        }

        fn repo_groups(&self) -> Result<Vec<String>, StoreError> {
            self.0.repo_groups()
        }

        fn servers(&self) -> Result<Vec<ApiServer>, StoreError> {
            self.0.servers()
        }
    }

    impl ItemStore for FailingDeletes {
        fn update(&self, id: &ItemId, change: &mut dyn FnMut(&mut Item)) -> Result<(), StoreError> {
            self.0.update(id, change)
        }

        fn update_many(
            &self,
            ids: &[ItemId],
            change: &mut dyn FnMut(&mut Item),
        ) -> Result<usize, StoreError> {
            self.0.update_many(ids, change)
        }

        fn delete(&self, _ids: &[ItemId]) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable)
        }

        fn upsert(&self, items: Vec<Item>) -> Result<(), StoreError> {
            self.0.upsert(items)
        }

        fn set_servers(&self, servers: Vec<ApiServer>) -> Result<(), StoreError> {
            self.0.set_servers(servers)
        }

        fn subscribe(&self) -> Receiver<ChangeBatch> {
            self.0.subscribe()
        }

        fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
            self.0.snapshot()
        }
    }

    struct Fixture {
        store: Arc<dyn ItemStore>,
        controller: Controller<ScriptedSync, FileTransport>,
        dir: tempfile::TempDir,
        start: Instant,
    }

    impl Fixture {
        fn mailbox(&self) -> std::path::PathBuf {
            self.dir.path().join("companion")
        }

        /// Drop one request into the companion mailbox and tick until it is answered.
        fn ask(&mut self, message: Value) -> CompanionResponse {
            let mailbox = self.mailbox();
            fs::create_dir_all(&mailbox).expect("mailbox");
            let line = json!({ "requestId": "req-1", "message": message });
            fs::write(mailbox.join("requests.jsonl"), format!("{line}\n")).expect("request");
            for step in 1..500u64 {
                self.controller
                    .tick(self.start + Duration::from_millis(step * 5));
                if let Ok(replies) = fs::read_to_string(mailbox.join("replies.jsonl"))
                    && let Some(reply) = replies.lines().next()
                {
                    let reply: Value = serde_json::from_str(reply).expect("reply json");
                    assert_eq!(reply["requestId"], "req-1");
                    return serde_json::from_value(reply["response"].clone()).expect("response");
                }
                thread::sleep(Duration::from_millis(2));
            }
            panic!("no companion response");
        }
    }

    fn fixture_with(store: Arc<dyn ItemStore>, sync: ScriptedSync) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let exporter = OverviewExporter::new(
            FileTransport::new(dir.path().join("companion")),
            dir.path().join("overview.json"),
        );
        let mut controller = Controller::new(
            store.clone(),
            sync,
            exporter,
            Settings::default(),
            UiState::default(),
        );
        let start = Instant::now();
        // first tick runs the periodic sweep and auto refresh
        controller.tick(start);
        controller.tick(start);
        Fixture {
            store,
            controller,
            dir,
            start,
        }
    }

    fn fixture(items: Vec<Item>, sync: ScriptedSync) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.upsert(items).expect("seed");
        fixture_with(store, sync)
    }

    fn team_pr(id: &str) -> Item {
        let mut item = pr(id, &format!("PR {id}"));
        item.repo = Repo {
            full_name: "acme/widgets".to_owned(),
            group: Some("team-a".to_owned()),
        };
        item.alert = true;
        item
    }

    #[test]
    fn debouncer_fires_once_after_the_last_poke() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(1));
        assert!(!debouncer.fire(start));
        debouncer.poke(start);
        debouncer.poke(start + Duration::from_millis(600));
        assert!(!debouncer.fire(start + Duration::from_millis(1200)));
        assert!(debouncer.fire(start + Duration::from_millis(1600)));
        assert!(!debouncer.fire(start + Duration::from_secs(5)));
    }

    #[test]
    fn marking_all_read_clears_the_badge() {
        let mut f = fixture(
            vec![team_pr("1"), team_pr("2"), team_pr("3")],
            ScriptedSync::default(),
        );
        let c = &mut f.controller;
        assert_eq!(c.tabs().tabs().len(), 1);
        assert_eq!(c.tabs().current().expect("tab").badge, 3);
        assert_eq!(c.title(), "3 PRs (3 updates)");

        c.mark_all_read();
        assert!(c.confirmation().is_some());
        c.confirm(true);
        assert_eq!(c.status(), Some("Marked 3 items as read"));

        c.tick(f.start + Duration::from_millis(100));
        assert_eq!(c.tabs().current().expect("tab").badge, 3);
        c.tick(f.start + Duration::from_millis(1200));
        assert_eq!(c.tabs().current().expect("tab").badge, 0);
        assert_eq!(c.title(), "3 Pull Requests");
    }

    #[test]
    fn bursts_of_writes_reconcile_once() {
        let mut f = fixture(vec![pr("a", "Alpha"), pr("b", "Beta")], ScriptedSync::default());
        for hour in [5, 6, 7] {
            f.store
                .update(&ItemId::new("b"), &mut |item| item.updated_at = at(hour))
                .expect("update");
        }
        let c = &mut f.controller;
        c.tick(f.start + Duration::from_millis(300));
        c.tick(f.start + Duration::from_millis(900));
        assert_eq!(c.live().snapshot().sections[0].rows[0], ItemId::new("a"));

        c.tick(f.start + Duration::from_millis(2000));
        assert_eq!(c.live().snapshot().sections[0].rows[0], ItemId::new("b"));
        assert!(matches!(c.presenter().last_redraw(), Redraw::Animated(_)));
    }

    #[test]
    fn background_reconcile_moves_a_vanished_selection_to_its_neighbour() {
        let mut a = pr("a", "Alpha");
        a.updated_at = at(9);
        let mut b = pr("b", "Beta");
        b.updated_at = at(8);
        let mut f = fixture(vec![a, b, pr("c", "Gamma")], ScriptedSync::default());
        f.controller.select_item(Some(ItemId::new("b")));
        f.controller.set_visibility(Visibility::Background);

        f.store.delete(&[ItemId::new("b")]).expect("delete");
        f.controller.tick(f.start + Duration::from_millis(1500));

        let presenter = f.controller.presenter();
        assert_eq!(presenter.last_redraw(), &Redraw::Full);
        assert_eq!(presenter.selected(), Some(&ItemId::new("c")));
    }

    #[test]
    fn filter_text_is_debounced() {
        let mut bugfix = pr("a", "Bugfix login");
        bugfix.updated_at = at(9);
        let mut f = fixture(vec![bugfix, pr("b", "Feature")], ScriptedSync::default());
        let c = &mut f.controller;
        c.set_filter_text("bug", f.start);
        c.set_filter_text("bugfix", f.start + Duration::from_millis(200));
        c.tick(f.start + Duration::from_millis(600));
        assert_eq!(c.live().snapshot().row_count(), 2);
        c.tick(f.start + Duration::from_millis(800));
        assert_eq!(c.live().snapshot().row_count(), 1);
        assert_eq!(c.ui_state().filter_text, "bugfix");
    }

    #[test]
    fn refresh_is_refused_offline() {
        let mut f = fixture(
            vec![pr("a", "Alpha")],
            ScriptedSync {
                offline: true,
                ..ScriptedSync::default()
            },
        );
        f.controller.refresh();
        assert_eq!(
            f.controller.alert().map(|(title, _)| title.as_str()),
            Some("No Network")
        );
    }

    #[test]
    fn latest_refresh_result_updates_the_status() {
        let f = fixture(vec![pr("a", "Alpha")], ScriptedSync::default());
        assert_eq!(f.controller.status(), Some("Refreshed: 1 items, 0 removed"));
    }

    #[test]
    fn stale_refresh_completion_is_ignored() {
        let mut f = fixture(
            vec![pr("a", "Alpha")],
            ScriptedSync {
                superseded: true,
                ..ScriptedSync::default()
            },
        );
        assert_eq!(f.controller.status(), None);

        f.controller.refresh();
        f.controller.tick(f.start + Duration::from_millis(10));
        assert!(!f.controller.is_refreshing());
        assert_eq!(f.controller.status(), None);
        assert_eq!(f.controller.alert(), None);
    }

    fn companion_refresh(advance: bool) -> CompanionResponse {
        let mut f = fixture(
            vec![pr("a", "Alpha")],
            ScriptedSync {
                advance,
                last: Some(at(0)),
                ..ScriptedSync::default()
            },
        );
        f.ask(json!({ "command": "refresh", "list": "overview" }))
    }

    #[test]
    fn companion_refresh_reports_success_when_sync_advanced() {
        let response = companion_refresh(true);
        assert_eq!(response.status, "Success");
        assert!(response.result.is_some());
    }

    #[test]
    fn companion_refresh_fails_when_timestamp_is_unchanged() {
        let response = companion_refresh(false);
        assert_eq!(response.status, "Refresh Failed");
        assert!(response.error);
    }

    #[test]
    fn companion_command_failure_is_reported_to_the_peer() {
        let store = MemoryStore::new();
        let mut merged = pr("m", "Merged");
        merged.condition = ItemCondition::Merged;
        store.upsert(vec![merged]).expect("seed");
        let mut f = fixture_with(Arc::new(FailingDeletes(store)), ScriptedSync::default());

        let response = f.ask(json!({ "command": "clearAllMerged" }));
        assert!(response.error);
        assert_eq!(response.status, "Update failed");
        assert!(f.store.item(&ItemId::new("m")).expect("read").is_some());
        // companion failures do not pop up on the desktop
        assert_eq!(f.controller.alert(), None);
    }

    #[test]
    fn companion_open_of_a_missing_item_fails() {
        let mut f = fixture(vec![pr("a", "Alpha")], ScriptedSync::default());
        let response = f.ask(json!({ "command": "openItem", "localId": "missing" }));
        assert!(response.error);
        assert_eq!(response.status, "Item not found");

        let _ = fs::remove_file(f.mailbox().join("replies.jsonl"));
        let response = f.ask(json!({ "command": "openItem", "localId": "a" }));
        assert_eq!(response.status, "Success");
        assert_eq!(f.controller.presenter().selected(), Some(&ItemId::new("a")));
    }

    #[test]
    fn deep_link_selects_the_item_tab() {
        let mut f = fixture(
            vec![pr("a", "Alpha"), issue("i", "Issue")],
            ScriptedSync::default(),
        );
        let c = &mut f.controller;
        c.select_tab(0);
        assert_eq!(c.tabs().viewing_kind(), Some(ItemKind::PullRequest));
        c.deep_link("i", Some("read"));
        assert_eq!(c.tabs().viewing_kind(), Some(ItemKind::Issue));
        assert_eq!(c.presenter().selected(), Some(&ItemId::new("i")));
        assert_eq!(c.detail(), Some(&ItemId::new("i")));

        c.deep_link("missing", None);
        assert_eq!(
            c.alert().map(|(title, _)| title.as_str()),
            Some("Item not found")
        );
    }

    #[derive(Clone, Debug)]
    enum Mutation {
        Read(usize),
        Unread(usize),
        Alert(usize),
        Mute(usize, bool),
        Delete(usize),
    }

    fn arb_mutation() -> impl Strategy<Value = Mutation> {
        prop_oneof![
            (0usize..6).prop_map(Mutation::Read),
            (0usize..6).prop_map(Mutation::Unread),
            (0usize..6).prop_map(Mutation::Alert),
            (0usize..6, any::<bool>()).prop_map(|(i, muted)| Mutation::Mute(i, muted)),
            (0usize..6).prop_map(Mutation::Delete),
        ]
    }

    fn mixed_items() -> Vec<Item> {
        (0..6)
            .map(|i| {
                let id = format!("{i}");
                let mut item = if i % 2 == 0 {
                    pr(&id, "PR")
                } else {
                    issue(&id, "Issue")
                };
                if i < 3 {
                    item.repo = Repo {
                        full_name: "acme/widgets".to_owned(),
                        group: Some("team-a".to_owned()),
                    };
                }
                item.alert = i % 3 == 0;
                item
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn badges_match_a_fresh_count_after_reconciling(
            mutations in prop::collection::vec(arb_mutation(), 1..12)
        ) {
            let mut f = fixture(mixed_items(), ScriptedSync::default());
            let mut now = f.start;
            for mutation in &mutations {
                let (index, mut change): (usize, Box<dyn FnMut(&mut Item)>) = match *mutation {
                    Mutation::Read(i) => (i, Box::new(|item: &mut Item| item.mark_read(at(23)))),
                    Mutation::Unread(i) => (i, Box::new(|item: &mut Item| item.mark_unread())),
                    Mutation::Alert(i) => (i, Box::new(|item: &mut Item| item.alert = true)),
                    Mutation::Mute(i, muted) => {
                        (i, Box::new(move |item: &mut Item| item.set_mute(muted)))
                    }
                    Mutation::Delete(i) => {
                        f.store.delete(&[ItemId::new(format!("{i}"))]).expect("delete");
                        continue;
                    }
                };
                // updates to deleted items are no-ops
                f.store
                    .update_many(&[ItemId::new(format!("{index}"))], &mut *change)
                    .expect("update");
                now += Duration::from_millis(400);
                f.controller.tick(now);
            }
            f.controller.tick(now + STORE_CHANGE_DEBOUNCE + Duration::from_millis(1));

            for tab in f.controller.tabs().tabs() {
                let fresh = badge_count(&*f.store, tab.kind, tab.criterion.as_ref())
                    .expect("count");
                prop_assert_eq!(tab.badge, fresh);
            }
        }
    }
}
