//! Companion-device export: overview summary, persisted snapshot, push and
//! the request/response protocol.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    domain::{DISTANT_PAST, GroupingCriterion, Item, ItemId, ItemKind, Section, ServerId},
    query::ItemQuery,
    storage::{self, Settings, StorageError},
    store::{ItemSource, StoreError, StoreSnapshot, badge_count},
};

pub const SUCCESS_COLOR: &str = "00FF00";
pub const FAILURE_COLOR: &str = "FF0000";

// -----------------------------------------------------------------------------
// Overview summary
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionCounts {
    pub total: usize,
    pub unread: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindOverview {
    pub mine: SectionCounts,
    pub participated: SectionCounts,
    pub mentioned: SectionCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<SectionCounts>,
    pub closed: SectionCounts,
    pub other: SectionCounts,
    pub snoozed: SectionCounts,
    pub total: usize,
    pub total_open: usize,
    pub unread: usize,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewView {
    pub title: String,
    pub api_uri: String,
    pub group: String,
    pub prs: KindOverview,
    pub issues: KindOverview,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub views: Vec<OverviewView>,
    pub prefer_issues: bool,
    pub last_updated: DateTime<Utc>,
    pub total_unread: usize,
}

/// Everything a background export needs, detached from the live store.
#[derive(Clone, Debug)]
pub struct ExportContext {
    pub snapshot: StoreSnapshot,
    pub criteria: Vec<Option<GroupingCriterion>>,
    pub settings: Settings,
    pub last_updated: Option<DateTime<Utc>>,
}

fn kind_overview<S: ItemSource + ?Sized>(
    source: &S,
    kind: ItemKind,
    criterion: Option<&GroupingCriterion>,
    hide_uncommented: bool,
) -> Result<KindOverview, StoreError> {
    let counts = |section: Section| -> Result<SectionCounts, StoreError> {
        let scope = ItemQuery::new(kind)
            .with_criterion(criterion.cloned())
            .in_section(section);
        // Unread follows badge scope, which ignores the uncommented filter.
        let unread = source.count(&scope.clone().only_unread())?;
        Ok(SectionCounts {
            total: source.count(&scope.hiding_uncommented(hide_uncommented))?,
            unread,
        })
    };

    let mut overview = KindOverview {
        mine: counts(Section::Mine)?,
        participated: counts(Section::Participated)?,
        mentioned: counts(Section::Mentioned)?,
        merged: match kind {
            ItemKind::PullRequest => Some(counts(Section::Merged)?),
            ItemKind::Issue => None,
        },
        closed: counts(Section::Closed)?,
        other: counts(Section::All)?,
        snoozed: counts(Section::Snoozed)?,
        unread: badge_count(source, kind, criterion)?,
        ..KindOverview::default()
    };
    let finished = overview.merged.unwrap_or_default().total + overview.closed.total;
    overview.total = [
        overview.mine,
        overview.participated,
        overview.mentioned,
        overview.other,
        overview.snoozed,
    ]
    .iter()
    .map(|counts| counts.total)
    .sum::<usize>()
        + finished;
    overview.total_open = overview.total - finished;
    if overview.total == 0 {
        overview.error = crate::query::reason_for_empty(kind, None, criterion);
    }
    Ok(overview)
}

/// Per-tab counts for both kinds plus the global unread total.
pub fn build_overview<S: ItemSource + ?Sized>(
    source: &S,
    criteria: &[Option<GroupingCriterion>],
    settings: &Settings,
    last_updated: Option<DateTime<Utc>>,
) -> Result<Overview, StoreError> {
    let hide = settings.hide_uncommented_items;
    let mut views = Vec::with_capacity(criteria.len());
    let mut total_unread = 0;
    for criterion in criteria {
        let criterion = criterion.as_ref();
        let prs = kind_overview(source, ItemKind::PullRequest, criterion, hide)?;
        let issues = kind_overview(source, ItemKind::Issue, criterion, hide)?;
        total_unread += prs.unread + issues.unread;
        views.push(OverviewView {
            title: criterion.map(|c| c.label().to_owned()).unwrap_or_default(),
            api_uri: criterion
                .and_then(GroupingCriterion::server_id)
                .map(ToString::to_string)
                .unwrap_or_default(),
            group: match criterion {
                Some(GroupingCriterion::RepoGroup(group)) => group.clone(),
                _ => String::new(),
            },
            prs,
            issues,
        });
    }
    Ok(Overview {
        views,
        prefer_issues: settings.prefer_issues_in_watch,
        last_updated: last_updated.unwrap_or(DISTANT_PAST),
        total_unread,
    })
}

// -----------------------------------------------------------------------------
// Item list & detail
// -----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorText {
    pub color: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub local_id: ItemId,
    pub title: String,
    pub subtitle: String,
    pub comment_count: usize,
    pub unread_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<ColorText>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<ColorText>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEntry {
    pub user: String,
    pub date: DateTime<Utc>,
    pub text: String,
    pub mine: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetail {
    #[serde(flatten)]
    pub entry: ListEntry,
    pub description: String,
    pub comments: Vec<CommentEntry>,
}

fn list_entry(item: &Item, settings: &Settings) -> ListEntry {
    let show_statuses = item.kind() == ItemKind::PullRequest && settings.show_status_items;
    ListEntry {
        local_id: item.id.clone(),
        title: item.title.clone(),
        subtitle: item.subtitle(),
        comment_count: item.comments.len(),
        unread_count: item.unread_comments(),
        labels: settings.show_labels.then(|| {
            item.labels
                .iter()
                .map(|label| ColorText {
                    color: label.color.to_uppercase(),
                    text: label.name.clone(),
                })
                .collect()
        }),
        statuses: show_statuses.then(|| {
            item.statuses()
                .iter()
                .map(|status| ColorText {
                    color: status.state.color().to_owned(),
                    text: status.description_text(),
                })
                .collect()
        }),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemListRequest {
    pub kind: ItemKind,
    pub section: Option<Section>,
    pub from: usize,
    pub count: usize,
    pub server: Option<ServerId>,
    pub group: Option<String>,
    pub only_unread: bool,
}

pub fn item_list<S: ItemSource + ?Sized>(
    source: &S,
    request: &ItemListRequest,
    settings: &Settings,
) -> Result<Vec<ListEntry>, StoreError> {
    let criterion = match (&request.server, &request.group) {
        (Some(id), _) => {
            let label = source
                .servers()?
                .into_iter()
                .find(|server| server.id == *id)
                .map_or_else(|| id.to_string(), |server| server.label);
            Some(GroupingCriterion::Server {
                id: id.clone(),
                label,
            })
        }
        (None, Some(group)) => Some(GroupingCriterion::RepoGroup(group.clone())),
        (None, None) => None,
    };
    let mut query = ItemQuery::new(request.kind)
        .with_criterion(criterion)
        .hiding_uncommented(settings.hide_uncommented_items)
        .sorted_by(settings.sort, settings.sort_descending);
    if let Some(section) = request.section {
        query = query.in_section(section);
    }
    if request.only_unread {
        query = query.only_unread();
    }
    Ok(source
        .page(&query, request.from, request.count)?
        .iter()
        .map(|item| list_entry(item, settings))
        .collect())
}

/// Entry plus description and comments, newest first.
pub fn item_detail<S: ItemSource + ?Sized>(
    source: &S,
    id: &ItemId,
    settings: &Settings,
) -> Result<Option<ItemDetail>, StoreError> {
    let Some(item) = source.item(id)? else {
        return Ok(None);
    };
    let mut comments: Vec<CommentEntry> = item
        .comments
        .iter()
        .map(|comment| CommentEntry {
            user: comment.author.clone(),
            date: comment.created_at,
            text: comment.body.clone(),
            mine: comment.is_mine,
        })
        .collect();
    comments.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(Some(ItemDetail {
        entry: list_entry(&item, settings),
        description: item.body.clone(),
        comments,
    }))
}

// -----------------------------------------------------------------------------
// Protocol
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Missing field '{0}'")]
    Missing(&'static str),
    #[error("Unknown item type '{0}'")]
    UnknownType(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Refresh,
    OpenItem(Option<ItemId>),
    OpenComment(Option<String>),
    ClearAllMerged,
    ClearAllClosed,
    MarkEverythingRead,
    MarkItemsRead(Vec<ItemId>),
    NeedsOverview,
    /// No command; only the list part of the request applies.
    None,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListRequest {
    Overview,
    ItemList(ItemListRequest),
    ItemDetail(Option<ItemId>),
    None,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawRequest {
    command: Option<String>,
    list: Option<String>,
    local_id: Option<String>,
    id: Option<String>,
    item_uris: Vec<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    section_index: Option<i64>,
    from: usize,
    count: Option<usize>,
    api_uri: String,
    group: String,
    only_unread: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompanionRequest {
    pub command: Command,
    pub list: ListRequest,
}

impl CompanionRequest {
    pub fn parse(message: Value) -> Result<Self, RequestError> {
        let raw: RawRequest = serde_json::from_value(message)?;
        let local_id = raw.local_id.clone().map(ItemId::new);

        let command = match raw.command.as_deref() {
            Some("refresh") => Command::Refresh,
            Some("openItem") => Command::OpenItem(local_id.clone()),
            Some("opencomment") => Command::OpenComment(raw.id.clone()),
            Some("clearAllMerged") => Command::ClearAllMerged,
            Some("clearAllClosed") => Command::ClearAllClosed,
            Some("markEverythingRead") => Command::MarkEverythingRead,
            Some("markItemsRead") => Command::MarkItemsRead(match &local_id {
                Some(id) => vec![id.clone()],
                None => raw.item_uris.iter().map(ItemId::new).collect(),
            }),
            Some("needsOverview") => Command::NeedsOverview,
            _ => Command::None,
        };

        let list = match raw.list.as_deref() {
            Some("overview") => ListRequest::Overview,
            Some("item_detail") => ListRequest::ItemDetail(local_id),
            Some("item_list") => {
                let kind = match raw.kind.as_deref() {
                    Some("prs") => ItemKind::PullRequest,
                    Some("issues") => ItemKind::Issue,
                    Some(other) => return Err(RequestError::UnknownType(other.to_owned())),
                    None => return Err(RequestError::Missing("type")),
                };
                ListRequest::ItemList(ItemListRequest {
                    kind,
                    section: raw.section_index.and_then(Section::from_index),
                    from: raw.from,
                    count: raw.count.ok_or(RequestError::Missing("count"))?,
                    server: (!raw.api_uri.is_empty()).then(|| ServerId(raw.api_uri.clone())),
                    group: (!raw.group.is_empty()).then(|| raw.group.clone()),
                    only_unread: raw.only_unread,
                })
            }
            _ => ListRequest::None,
        };

        Ok(Self { command, list })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompanionResponse {
    pub status: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl CompanionResponse {
    pub fn success(result: Option<Value>) -> Self {
        Self {
            status: "Success".to_owned(),
            color: SUCCESS_COLOR.to_owned(),
            error: false,
            result,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: reason.into(),
            color: FAILURE_COLOR.to_owned(),
            error: true,
            result: None,
        }
    }
}

/// Answers one request exactly once. Dropping it unanswered sends a failure.
#[derive(Debug)]
pub struct ReplyHandle {
    reply: Option<Sender<CompanionResponse>>,
}

impl ReplyHandle {
    pub fn channel() -> (Self, Receiver<CompanionResponse>) {
        let (tx, rx) = mpsc::channel();
        (Self { reply: Some(tx) }, rx)
    }

    pub fn respond(mut self, response: CompanionResponse) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(response);
        }
    }

    pub fn succeed(self, result: Option<Value>) {
        self.respond(CompanionResponse::success(result));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.respond(CompanionResponse::failure(reason));
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            warn!("companion request dropped without an answer");
            let _ = reply.send(CompanionResponse::failure("Request Dropped"));
        }
    }
}

// -----------------------------------------------------------------------------
// Transport
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("companion mailbox I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("companion mailbox entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not write companion context: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerStatus {
    pub paired: bool,
    pub app_installed: bool,
    pub activated: bool,
    pub reachable: bool,
}

impl PeerStatus {
    pub const CONNECTED: PeerStatus = PeerStatus {
        paired: true,
        app_installed: true,
        activated: true,
        reachable: true,
    };

    /// A context update can be delivered, now or when the peer wakes.
    pub fn accepts_context(self) -> bool {
        self.paired && self.app_installed && self.activated
    }
}

pub trait CompanionTransport: Send {
    fn status(&self) -> PeerStatus;

    fn update_context(&mut self, overview: &Overview) -> Result<(), TransportError>;

    /// Deliver finished replies and take the requests that arrived since the
    /// last call, in arrival order.
    fn exchange(&mut self) -> Vec<(Value, ReplyHandle)>;
}

/// A peer that has not written for this long counts as unreachable.
pub const PEER_REACHABLE_WINDOW: Duration = Duration::from_secs(300);

const CONTEXT_FILE: &str = "context.json";
const REQUESTS_FILE: &str = "requests.jsonl";
const TAKEN_REQUESTS_FILE: &str = "requests.taken";
const REPLIES_FILE: &str = "replies.jsonl";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestEnvelope {
    request_id: String,
    #[serde(default)]
    message: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyEnvelope<'a> {
    request_id: &'a str,
    response: &'a CompanionResponse,
}

/// Mailbox directory shared with a companion process.
///
/// The companion appends `{"requestId", "message"}` lines to
/// `requests.jsonl` and reads `{"requestId", "response"}` lines from
/// `replies.jsonl`. The latest overview sits in `context.json`. Peer status
/// is derived from when the companion last wrote a request.
pub struct FileTransport {
    root: PathBuf,
    last_seen: Option<Instant>,
    outstanding: Vec<(String, Receiver<CompanionResponse>)>,
}

impl FileTransport {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            last_seen: None,
            outstanding: Vec::new(),
        }
    }

    fn deliver_replies(&mut self) -> Result<(), TransportError> {
        let mut ready = Vec::new();
        self.outstanding.retain(|(request_id, reply)| match reply.try_recv() {
            Ok(response) => {
                ready.push((request_id.clone(), response));
                false
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Disconnected) => false,
        });
        if ready.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(REPLIES_FILE))?;
        for (request_id, response) in &ready {
            let line = serde_json::to_string(&ReplyEnvelope {
                request_id,
                response,
            })?;
            writeln!(file, "{line}")?;
        }
        debug!(count = ready.len(), "companion replies delivered");
        Ok(())
    }

    /// Move the request file aside before reading so lines appended
    /// meanwhile land in a fresh file.
    fn take_requests(&self) -> Result<String, TransportError> {
        let taken = self.root.join(TAKEN_REQUESTS_FILE);
        match fs::rename(self.root.join(REQUESTS_FILE), &taken) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
            Err(err) => return Err(err.into()),
        }
        let contents = fs::read_to_string(&taken)?;
        fs::remove_file(&taken)?;
        Ok(contents)
    }
}

impl CompanionTransport for FileTransport {
    fn status(&self) -> PeerStatus {
        let seen = self.last_seen.is_some();
        PeerStatus {
            paired: self.root.is_dir(),
            app_installed: seen,
            activated: seen,
            reachable: self
                .last_seen
                .is_some_and(|at| at.elapsed() < PEER_REACHABLE_WINDOW),
        }
    }

    fn update_context(&mut self, overview: &Overview) -> Result<(), TransportError> {
        fs::create_dir_all(&self.root)?;
        storage::write_json(&self.root.join(CONTEXT_FILE), &json!({ "overview": overview }))?;
        Ok(())
    }

    fn exchange(&mut self) -> Vec<(Value, ReplyHandle)> {
        if let Err(err) = self.deliver_replies() {
            warn!(error = %err, "companion replies could not be delivered");
        }
        let contents = match self.take_requests() {
            Ok(contents) => contents,
            Err(err) => {
                warn!(error = %err, "companion requests could not be read");
                return Vec::new();
            }
        };

        let mut requests = Vec::new();
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            self.last_seen = Some(Instant::now());
            match serde_json::from_str::<RequestEnvelope>(line) {
                Ok(envelope) => {
                    let (handle, reply) = ReplyHandle::channel();
                    self.outstanding.push((envelope.request_id, reply));
                    requests.push((envelope.message, handle));
                }
                Err(err) => warn!(error = %err, "malformed companion request skipped"),
            }
        }
        requests
    }
}

// -----------------------------------------------------------------------------
// Exporter
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("export worker disconnected")]
    WorkerGone,
}

struct BackgroundJob<R> {
    receiver: Receiver<R>,
}

impl<R: Send + 'static> BackgroundJob<R> {
    fn spawn(work: impl FnOnce() -> R + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(work());
        });
        Self { receiver: rx }
    }

    fn try_take(&self) -> Result<Option<R>, ExportError> {
        match self.receiver.try_recv() {
            Ok(result) => Ok(Some(result)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ExportError::WorkerGone),
        }
    }
}

pub struct OverviewExporter<T: CompanionTransport> {
    transport: T,
    overview_path: PathBuf,
    building: Option<BackgroundJob<Result<Overview, StoreError>>>,
    answers: Vec<(ReplyHandle, BackgroundJob<CompanionResponse>)>,
}

impl<T: CompanionTransport> OverviewExporter<T> {
    pub fn new(transport: T, overview_path: PathBuf) -> Self {
        Self {
            transport,
            overview_path,
            building: None,
            answers: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Rebuild the overview off the UI thread. A newer call supersedes an
    /// unfinished one.
    pub fn update_context(&mut self, context: ExportContext) {
        self.building = Some(BackgroundJob::spawn(move || {
            build_overview(
                &context.snapshot,
                &context.criteria,
                &context.settings,
                context.last_updated,
            )
        }));
    }

    /// Answer the list part of a request in the background.
    pub fn answer(&mut self, list: ListRequest, context: ExportContext, handle: ReplyHandle) {
        let job = BackgroundJob::spawn(move || answer_list(list, &context));
        self.answers.push((handle, job));
    }

    /// Collect finished background work. Returns a freshly built overview.
    pub fn poll(&mut self) -> Option<Overview> {
        let finished = std::mem::take(&mut self.answers);
        for (handle, job) in finished {
            match job.try_take() {
                Ok(Some(response)) => handle.respond(response),
                Ok(None) => self.answers.push((handle, job)),
                Err(err) => handle.fail(err.to_string()),
            }
        }

        let built = match self.building.as_ref()?.try_take() {
            Ok(None) => return None,
            Ok(Some(result)) => result.map_err(ExportError::from),
            Err(err) => Err(err),
        };
        self.building = None;
        match built.and_then(|overview| self.persist(&overview).map(|()| overview)) {
            Ok(overview) => {
                debug!(views = overview.views.len(), "overview updated");
                self.send_overview();
                Some(overview)
            }
            Err(err) => {
                warn!(error = %err, "overview export failed");
                None
            }
        }
    }

    fn persist(&self, overview: &Overview) -> Result<(), ExportError> {
        storage::write_json(&self.overview_path, overview)?;
        Ok(())
    }

    pub fn persisted(&self) -> Option<Overview> {
        load_overview(&self.overview_path).unwrap_or_else(|err| {
            warn!(error = %err, path = %self.overview_path.display(), "persisted overview unreadable");
            None
        })
    }

    /// Push the persisted overview. Skipped, not retried, when the peer cannot take it.
    pub fn send_overview(&mut self) -> bool {
        let status = self.transport.status();
        if !status.accepts_context() {
            debug!(?status, "companion not available; overview push skipped");
            return false;
        }
        let Some(overview) = self.persisted() else {
            return false;
        };
        match self.transport.update_context(&overview) {
            Ok(()) => {
                info!(unread = overview.total_unread, "overview pushed to companion");
                true
            }
            Err(err) => {
                warn!(error = %err, "error updating companion context");
                false
            }
        }
    }

    /// Resend when the peer becomes reachable again.
    pub fn on_reachability_change(&mut self) -> bool {
        self.transport.status().reachable && self.send_overview()
    }
}

fn answer_list(list: ListRequest, context: &ExportContext) -> CompanionResponse {
    let snapshot = &context.snapshot;
    let settings = &context.settings;
    let result = match list {
        ListRequest::None => return CompanionResponse::success(None),
        ListRequest::Overview => {
            build_overview(snapshot, &context.criteria, settings, context.last_updated)
                .map_err(|err| err.to_string())
                .and_then(|overview| encode(&overview))
        }
        ListRequest::ItemList(request) => item_list(snapshot, &request, settings)
            .map_err(|err| err.to_string())
            .and_then(|entries| encode(&entries)),
        ListRequest::ItemDetail(id) => {
            let detail = match id {
                Some(id) => item_detail(snapshot, &id, settings),
                None => Ok(None),
            };
            match detail {
                Ok(Some(detail)) => encode(&detail),
                Ok(None) => return CompanionResponse::failure("Item Not Found"),
                Err(err) => Err(err.to_string()),
            }
        }
    };
    match result {
        Ok(value) => CompanionResponse::success(Some(value)),
        Err(reason) => CompanionResponse::failure(reason),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| {
        warn!(error = %err, "companion reply could not be encoded");
        format!("Encoding Failed: {err}")
    })
}

/// Read the overview the exporter persisted, if any.
pub fn load_overview(path: &Path) -> Result<Option<Overview>, StorageError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ItemCondition, Label, Repo, fixtures::*},
        store::{ItemStore, MemoryStore},
    };

    struct RecordingTransport {
        status: PeerStatus,
        sent: Vec<Overview>,
    }

    impl CompanionTransport for RecordingTransport {
        fn status(&self) -> PeerStatus {
            self.status
        }

        fn update_context(&mut self, overview: &Overview) -> Result<(), TransportError> {
            self.sent.push(overview.clone());
            Ok(())
        }

        fn exchange(&mut self) -> Vec<(Value, ReplyHandle)> {
            Vec::new()
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let mut unread_mine = pr("1", "Mine");
        unread_mine.alert = true;
        let mut merged = pr("2", "Merged");
        merged.condition = ItemCondition::Merged;
        let mut grouped = issue("3", "Grouped issue");
        grouped.repo = Repo {
            full_name: "acme/gadgets".to_owned(),
            group: Some("team-a".to_owned()),
        };
        grouped.alert = true;
        store
            .upsert(vec![unread_mine, merged, grouped])
            .expect("seed");
        store
    }

    fn context(store: &MemoryStore, settings: Settings) -> ExportContext {
        ExportContext {
            snapshot: store.snapshot().expect("snapshot"),
            criteria: vec![Some(GroupingCriterion::RepoGroup("team-a".to_owned())), None],
            settings,
            last_updated: Some(at(10)),
        }
    }

    fn wait_for<R>(mut poll: impl FnMut() -> Option<R>) -> R {
        for _ in 0..500 {
            if let Some(value) = poll() {
                return value;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("background work did not finish");
    }

    #[test]
    fn overview_counts_sections_per_tab() {
        let store = seeded();
        let ctx = context(&store, Settings::default());
        let overview = build_overview(&ctx.snapshot, &ctx.criteria, &ctx.settings, ctx.last_updated)
            .expect("overview");

        assert_eq!(overview.views.len(), 2);
        let team = &overview.views[0];
        assert_eq!(team.title, "team-a");
        assert_eq!(team.group, "team-a");
        assert_eq!(team.prs.total, 0);
        assert_eq!(
            team.prs.error,
            "There are no pull requests in 'team-a' in your watched repositories."
        );
        assert_eq!(team.issues.mine, SectionCounts { total: 1, unread: 1 });
        assert!(team.issues.merged.is_none());

        let rest = &overview.views[1];
        assert_eq!(rest.title, "");
        assert_eq!(rest.prs.total, 2);
        assert_eq!(rest.prs.total_open, 1);
        assert_eq!(rest.prs.merged, Some(SectionCounts { total: 1, unread: 0 }));
        assert_eq!(rest.prs.unread, 1);
        assert!(rest.prs.error.is_empty());
        assert_eq!(overview.total_unread, 2);
        assert_eq!(overview.last_updated, at(10));

        let wire = serde_json::to_value(&overview).expect("encode");
        assert!(wire.get("preferIssues").is_some());
        assert!(wire["views"][1]["prs"].get("total_open").is_some());
        assert!(wire["views"][1]["issues"].get("merged").is_none());
    }

    #[test]
    fn section_unread_uses_badge_scope_when_hiding_uncommented() {
        let store = seeded();
        let settings = Settings {
            hide_uncommented_items: true,
            ..Settings::default()
        };
        let ctx = context(&store, settings);
        let overview = build_overview(&ctx.snapshot, &ctx.criteria, &ctx.settings, ctx.last_updated)
            .expect("overview");

        let rest = &overview.views[1];
        assert_eq!(rest.prs.mine, SectionCounts { total: 0, unread: 1 });
        assert_eq!(rest.prs.unread, rest.prs.mine.unread);
    }

    #[test]
    fn exporter_persists_and_skips_unavailable_peers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("overview.json");
        let store = seeded();
        let transport = RecordingTransport {
            status: PeerStatus {
                reachable: false,
                app_installed: false,
                ..PeerStatus::CONNECTED
            },
            sent: Vec::new(),
        };
        let mut exporter = OverviewExporter::new(transport, path.clone());

        exporter.update_context(context(&store, Settings::default()));
        let built = wait_for(|| exporter.poll());
        assert!(exporter.transport().sent.is_empty());
        assert_eq!(load_overview(&path).expect("read"), Some(built.clone()));

        assert!(!exporter.on_reachability_change());
        exporter.transport_mut().status = PeerStatus::CONNECTED;
        assert!(exporter.on_reachability_change());
        assert_eq!(exporter.transport().sent, vec![built]);
    }

    #[test]
    fn file_transport_exchanges_requests_and_replies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("companion");
        let mut transport = FileTransport::new(root.clone());
        assert!(!transport.status().accepts_context());
        assert!(transport.exchange().is_empty());

        fs::create_dir_all(&root).expect("mkdir");
        fs::write(
            root.join(REQUESTS_FILE),
            concat!(
                r#"{"requestId":"r1","message":{"command":"needsOverview"}}"#,
                "\n",
                "not json\n",
                r#"{"requestId":"r2","message":{"list":"overview"}}"#,
                "\n",
            ),
        )
        .expect("write requests");

        let mut requests = transport.exchange();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0["command"], "needsOverview");
        assert!(!root.join(REQUESTS_FILE).exists());
        assert_eq!(transport.status(), PeerStatus::CONNECTED);

        let (_, second) = requests.pop().expect("second");
        let (_, first) = requests.pop().expect("first");
        first.succeed(None);
        assert!(transport.exchange().is_empty());
        second.fail("Item Not Found");
        transport.exchange();

        let replies: Vec<Value> = fs::read_to_string(root.join(REPLIES_FILE))
            .expect("read replies")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["requestId"], "r1");
        assert_eq!(replies[0]["response"]["status"], "Success");
        assert_eq!(replies[1]["requestId"], "r2");
        assert_eq!(replies[1]["response"]["error"], true);

        let overview = build_overview(&MemoryStore::new(), &[None], &Settings::default(), None)
            .expect("overview");
        transport.update_context(&overview).expect("write");
        let written: Value =
            serde_json::from_str(&fs::read_to_string(root.join(CONTEXT_FILE)).expect("read"))
                .expect("json");
        assert_eq!(written["overview"]["views"][0]["prs"]["total"], 0);
    }

    #[test]
    fn reply_handles_answer_exactly_once() {
        let (handle, replies) = ReplyHandle::channel();
        handle.succeed(None);
        assert_eq!(replies.try_recv().expect("reply").status, "Success");
        assert!(replies.try_recv().is_err());

        let (handle, replies) = ReplyHandle::channel();
        drop(handle);
        let response = replies.try_recv().expect("reply");
        assert!(response.error);
        assert_eq!(response.color, FAILURE_COLOR);
        assert!(replies.try_recv().is_err());
    }

    #[test]
    fn requests_parse_commands_and_lists() {
        let request = CompanionRequest::parse(json!({
            "command": "markItemsRead",
            "itemUris": ["a", "b"],
            "list": "overview",
        }))
        .expect("parse");
        assert_eq!(
            request.command,
            Command::MarkItemsRead(vec![ItemId::new("a"), ItemId::new("b")])
        );
        assert_eq!(request.list, ListRequest::Overview);

        let request = CompanionRequest::parse(json!({
            "list": "item_list",
            "type": "issues",
            "sectionIndex": Section::Closed.index(),
            "from": 5,
            "count": 10,
            "apiUri": "",
            "group": "team-a",
            "onlyUnread": true,
        }))
        .expect("parse");
        assert_eq!(request.command, Command::None);
        assert_eq!(
            request.list,
            ListRequest::ItemList(ItemListRequest {
                kind: ItemKind::Issue,
                section: Some(Section::Closed),
                from: 5,
                count: 10,
                server: None,
                group: Some("team-a".to_owned()),
                only_unread: true,
            })
        );

        assert!(matches!(
            CompanionRequest::parse(json!({ "list": "item_list", "count": 3 })),
            Err(RequestError::Missing("type"))
        ));
    }

    #[test]
    fn item_list_pages_and_detail_sorts_comments() {
        let store = MemoryStore::new();
        let mut items = Vec::new();
        for n in 0..5u32 {
            let mut item = pr(&format!("p{n}"), &format!("PR {n}"));
            item.updated_at = at(n);
            item.labels.push(Label {
                name: "bug".to_owned(),
                color: "ff0000".to_owned(),
            });
            items.push(item);
        }
        items[4].comments = vec![comment("old", 1), comment("new", 7)];
        store.upsert(items).expect("seed");
        let settings = Settings {
            show_labels: true,
            sort_descending: true,
            ..Settings::default()
        };

        let request = ItemListRequest {
            kind: ItemKind::PullRequest,
            section: Some(Section::Mine),
            from: 1,
            count: 2,
            server: None,
            group: None,
            only_unread: false,
        };
        let page = item_list(&store, &request, &settings).expect("page");
        let ids: Vec<&str> = page.iter().map(|entry| entry.local_id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p2"]);
        assert_eq!(
            page[0].labels,
            Some(vec![ColorText {
                color: "FF0000".to_owned(),
                text: "bug".to_owned()
            }])
        );
        assert_eq!(page[0].statuses, None);

        let detail = item_detail(&store, &ItemId::new("p4"), &settings)
            .expect("detail")
            .expect("present");
        let dates: Vec<_> = detail.comments.iter().map(|c| c.date).collect();
        assert_eq!(dates, vec![at(7), at(1)]);
        assert_eq!(detail.entry.comment_count, 2);
    }

    #[test]
    fn missing_detail_answers_item_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded();
        let mut exporter = OverviewExporter::new(
            FileTransport::new(dir.path().join("companion")),
            dir.path().join("overview.json"),
        );
        let (handle, replies) = ReplyHandle::channel();
        exporter.answer(
            ListRequest::ItemDetail(Some(ItemId::new("nope"))),
            context(&store, Settings::default()),
            handle,
        );
        let response = wait_for(|| {
            exporter.poll();
            replies.try_recv().ok()
        });
        assert_eq!(response.status, "Item Not Found");
        assert!(response.error);
    }

    #[test]
    fn unencodable_replies_fail_instead_of_succeeding() {
        // JSON objects need string keys.
        let tuple_keyed: std::collections::BTreeMap<(u8, u8), u8> = [((1, 2), 3)].into();
        let reason = encode(&tuple_keyed).expect_err("tuple keys cannot become JSON");
        assert!(reason.starts_with("Encoding Failed"));
        assert!(encode(&SectionCounts::default()).is_ok());
    }
}
