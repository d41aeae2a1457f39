use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// Domain data structures shared across modules.

/// Read marker used for "never read"; everything the sync process records is newer.
pub const DISTANT_PAST: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

fn distant_past() -> DateTime<Utc> {
    DISTANT_PAST
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    PullRequest,
    Issue,
}

impl ItemKind {
    pub fn label(self) -> &'static str {
        match self {
            ItemKind::PullRequest => "Pull Requests",
            ItemKind::Issue => "Issues",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ItemKind::PullRequest => "pull requests",
            ItemKind::Issue => "issues",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiServer {
    pub id: ServerId,
    pub label: String,
    /// Configured with a working token.
    #[serde(default)]
    pub good_to_go: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub full_name: String,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCondition {
    Open,
    Closed,
    Merged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Involvement {
    Mine,
    Participated,
    Mentioned,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_mine: bool,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    /// Hex colour without the leading `#`.
    pub color: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn color(self) -> &'static str {
        match self {
            StatusState::Pending => "A0A000",
            StatusState::Success => "00A000",
            StatusState::Failure | StatusState::Error => "D00000",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub context: String,
    pub description: String,
    pub state: StatusState,
}

impl StatusCheck {
    pub fn description_text(&self) -> String {
        if self.description.is_empty() {
            self.context.clone()
        } else {
            format!("{} - {}", self.context, self.description)
        }
    }
}

/// Kind-specific data. The item's kind is always derived from this payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemPayload {
    PullRequest {
        #[serde(default)]
        statuses: Vec<StatusCheck>,
    },
    Issue,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnoozeState {
    #[default]
    Awake,
    Snoozing {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        #[serde(default)]
        wake_on_comment: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoozePreset {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub wake_on_comment: bool,
}

impl SnoozePreset {
    pub fn duration(&self) -> Duration {
        Duration::days(self.days) + Duration::hours(self.hours) + Duration::minutes(self.minutes)
    }

    pub fn list_description(&self) -> String {
        let mut parts = Vec::new();
        for (value, unit) in [
            (self.days, "day"),
            (self.hours, "hour"),
            (self.minutes, "minute"),
        ] {
            match value {
                0 => {}
                1 => parts.push(format!("1 {unit}")),
                n => parts.push(format!("{n} {unit}s")),
            }
        }
        if parts.is_empty() {
            "Until next refresh".to_owned()
        } else {
            format!("For {}", parts.join(", "))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub server_id: ServerId,
    pub repo: Repo,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub author: String,
    #[serde(default)]
    pub web_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub condition: ItemCondition,
    pub involvement: Involvement,
    #[serde(default = "distant_past")]
    pub last_read_at: DateTime<Utc>,
    #[serde(default)]
    pub alert: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub snooze: SnoozeState,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub payload: ItemPayload,
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        match self.payload {
            ItemPayload::PullRequest { .. } => ItemKind::PullRequest,
            ItemPayload::Issue => ItemKind::Issue,
        }
    }

    pub fn statuses(&self) -> &[StatusCheck] {
        match &self.payload {
            ItemPayload::PullRequest { statuses } => statuses,
            ItemPayload::Issue => &[],
        }
    }

    pub fn unread_comments(&self) -> usize {
        self.comments
            .iter()
            .filter(|comment| !comment.is_mine && comment.created_at > self.last_read_at)
            .count()
    }

    pub fn has_unread_comments_or_alert(&self) -> bool {
        self.alert || self.unread_comments() > 0
    }

    /// Whether the item contributes to badge counts.
    pub fn counts_as_unread(&self) -> bool {
        !self.muted && self.has_unread_comments_or_alert()
    }

    pub fn is_snoozing(&self) -> bool {
        matches!(self.snooze, SnoozeState::Snoozing { .. })
    }

    pub fn section(&self) -> Section {
        Section::of(self)
    }

    pub fn mark_read(&mut self, now: DateTime<Utc>) {
        self.last_read_at = now;
        self.alert = false;
    }

    pub fn mark_unread(&mut self) {
        self.last_read_at = DISTANT_PAST;
        if self.unread_comments() == 0 {
            self.alert = true;
        }
    }

    pub fn set_mute(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn snooze(&mut self, preset: &SnoozePreset, now: DateTime<Utc>) {
        self.snooze = SnoozeState::Snoozing {
            since: now,
            until: now + preset.duration(),
            wake_on_comment: preset.wake_on_comment,
        };
    }

    pub fn wake(&mut self) {
        self.snooze = SnoozeState::Awake;
    }

    /// Wake the item if its snooze expired or a qualifying comment arrived.
    pub fn wake_if_due(&mut self, now: DateTime<Utc>) -> bool {
        let due = match &self.snooze {
            SnoozeState::Awake => false,
            SnoozeState::Snoozing {
                since,
                until,
                wake_on_comment,
            } => {
                *until <= now
                    || (*wake_on_comment
                        && self
                            .comments
                            .iter()
                            .any(|comment| !comment.is_mine && comment.created_at > *since))
            }
        };
        if due {
            self.wake();
        }
        due
    }

    pub fn url_for_opening(&self) -> Option<&str> {
        self.web_url.as_deref().filter(|url| !url.is_empty())
    }

    pub fn find_comment(&self, comment_id: &str) -> Option<&Comment> {
        self.comments.iter().find(|comment| comment.id == comment_id)
    }

    pub fn subtitle(&self) -> String {
        format!(
            "{} #{} by {} · {}",
            self.repo.full_name,
            self.number,
            self.author,
            self.updated_at.format("%Y-%m-%d %H:%M")
        )
    }
}

/// Named bucket of the list, in display order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    None,
    Mine,
    Participated,
    Mentioned,
    Merged,
    Closed,
    All,
    Snoozed,
}

impl Section {
    pub const VISIBLE: [Section; 7] = [
        Section::Mine,
        Section::Participated,
        Section::Mentioned,
        Section::Merged,
        Section::Closed,
        Section::All,
        Section::Snoozed,
    ];

    pub fn of(item: &Item) -> Section {
        if item.hidden {
            return Section::None;
        }
        match item.condition {
            ItemCondition::Merged => return Section::Merged,
            ItemCondition::Closed => return Section::Closed,
            ItemCondition::Open => {}
        }
        if item.is_snoozing() {
            return Section::Snoozed;
        }
        match item.involvement {
            Involvement::Mine => Section::Mine,
            Involvement::Participated => Section::Participated,
            Involvement::Mentioned => Section::Mentioned,
            Involvement::Other => Section::All,
        }
    }

    pub fn matches(self, item: &Item) -> bool {
        Section::of(item) == self
    }

    pub fn index(self) -> i64 {
        self as i64
    }

    pub fn from_index(index: i64) -> Option<Section> {
        Section::VISIBLE
            .into_iter()
            .find(|section| section.index() == index)
    }

    pub fn display_name(self, kind: ItemKind) -> &'static str {
        match (self, kind) {
            (Section::None, _) => "",
            (Section::Mine, _) => "Mine",
            (Section::Participated, _) => "Participated",
            (Section::Mentioned, _) => "Mentioned",
            (Section::Merged, _) => "Recently Merged",
            (Section::Closed, _) => "Recently Closed",
            (Section::All, ItemKind::PullRequest) => "All Pull Requests",
            (Section::All, ItemKind::Issue) => "All Issues",
            (Section::Snoozed, _) => "Snoozed",
        }
    }

    /// Terminal sections offer bulk removal of their items.
    pub fn is_terminal(self, kind: ItemKind) -> bool {
        match self {
            Section::Closed => true,
            Section::Merged => kind == ItemKind::PullRequest,
            _ => false,
        }
    }
}

/// Tab partitioning key. The catch-all tab is represented by `None` at use sites.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingCriterion {
    RepoGroup(String),
    Server { id: ServerId, label: String },
}

impl GroupingCriterion {
    pub fn label(&self) -> &str {
        match self {
            GroupingCriterion::RepoGroup(group) => group,
            GroupingCriterion::Server { label, .. } => label,
        }
    }

    pub fn server_id(&self) -> Option<&ServerId> {
        match self {
            GroupingCriterion::RepoGroup(_) => None,
            GroupingCriterion::Server { id, .. } => Some(id),
        }
    }

    pub fn is_related_to(&self, item: &Item) -> bool {
        match self {
            GroupingCriterion::RepoGroup(group) => item.repo.group.as_deref() == Some(group),
            GroupingCriterion::Server { id, .. } => {
                item.server_id == *id && item.repo.group.is_none()
            }
        }
    }
}

/// Grouped repos live in their own tabs, so the catch-all excludes them.
pub fn criterion_matches(criterion: Option<&GroupingCriterion>, item: &Item) -> bool {
    match criterion {
        None => item.repo.group.is_none(),
        Some(criterion) => criterion.is_related_to(item),
    }
}
