use tracing::{debug, warn};

use crate::{
    domain::{GroupingCriterion, Item, ItemId, ItemKind, Section},
    live::{ChangeEvent, ResultSnapshot, RowPath, SnapshotSection},
    query::reason_for_empty,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

/// How the last reconciliation batch reached the screen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Redraw {
    #[default]
    None,
    Animated(Vec<ChangeEvent>),
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListState {
    Rows,
    Empty { reason: String },
    Failed { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RowAction {
    Read,
    Unread,
    Mute,
    Unmute,
    Snooze,
    Wake,
    Remove,
}

impl RowAction {
    pub fn title(self) -> &'static str {
        match self {
            RowAction::Read => "Read",
            RowAction::Unread => "Unread",
            RowAction::Mute => "Mute",
            RowAction::Unmute => "Unmute",
            RowAction::Snooze => "Snooze",
            RowAction::Wake => "Wake",
            RowAction::Remove => "Remove",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionHeader {
    pub title: String,
    /// Present on terminal sections: the section whose items "Remove all" deletes.
    pub remove_all: Option<Section>,
}

pub fn section_header(section: Section, kind: ItemKind) -> SectionHeader {
    SectionHeader {
        title: section.display_name(kind).to_uppercase(),
        remove_all: section.is_terminal(kind).then_some(section),
    }
}

/// Row actions offered for an item shown in `section`.
pub fn row_actions(
    item: &Item,
    section: Section,
    show_comments_everywhere: bool,
) -> Vec<RowAction> {
    let read_toggle = if item.has_unread_comments_or_alert() {
        RowAction::Read
    } else {
        RowAction::Unread
    };

    if section.is_terminal(item.kind()) {
        return vec![read_toggle, RowAction::Remove];
    }
    if item.is_snoozing() {
        return vec![RowAction::Wake];
    }

    let mut actions = Vec::with_capacity(3);
    if show_comments_everywhere || section != Section::All {
        actions.push(read_toggle);
    }
    actions.push(if item.muted {
        RowAction::Unmute
    } else {
        RowAction::Mute
    });
    actions.push(RowAction::Snooze);
    actions
}

fn updates_suffix(unread: usize) -> String {
    match unread {
        0 => String::new(),
        1 => " (1 update)".to_owned(),
        n => format!(" ({n} updates)"),
    }
}

/// Navigation title for a list of `total` items of which `unread` are unread.
pub fn list_title(kind: ItemKind, total: usize, unread: usize) -> String {
    match (kind, total) {
        (ItemKind::PullRequest, 0) => "No Pull Requests".to_owned(),
        (ItemKind::PullRequest, 1) if unread > 0 => format!("1 PR{}", updates_suffix(unread)),
        (ItemKind::PullRequest, 1) => "1 Pull Request".to_owned(),
        (ItemKind::PullRequest, n) if unread > 0 => format!("{n} PRs{}", updates_suffix(unread)),
        (ItemKind::PullRequest, n) => format!("{n} Pull Requests"),
        (ItemKind::Issue, 0) => "No Issues".to_owned(),
        (ItemKind::Issue, 1) => format!("1 Issue{}", updates_suffix(unread)),
        (ItemKind::Issue, n) => format!("{n} Issues{}", updates_suffix(unread)),
    }
}

/// Title of the list window. `kind` is `None` when no tab has content.
pub fn window_title(kind: Option<ItemKind>, total: usize, unread: usize, refreshing: bool) -> String {
    if refreshing {
        return "Refreshing…".to_owned();
    }
    match kind {
        Some(kind) => list_title(kind, total, unread),
        None => "No Items".to_owned(),
    }
}

/// Runs an edit script against `current`. Returns `None` when the script
/// does not fit the sections it is applied to.
pub(crate) fn apply_edit_script(
    current: &[SnapshotSection],
    events: &[ChangeEvent],
    target: &ResultSnapshot,
) -> Option<Vec<SnapshotSection>> {
    let mut working = current.to_vec();

    let mut row_removals = Vec::new();
    let mut section_removals = Vec::new();
    let mut section_insertions = Vec::new();
    let mut row_insertions = Vec::new();
    for event in events {
        match *event {
            ChangeEvent::RowDeleted { at } => row_removals.push(at),
            ChangeEvent::SectionDeleted { index } => section_removals.push(index),
            ChangeEvent::SectionInserted { index } => section_insertions.push(index),
            ChangeEvent::RowInserted { at } => row_insertions.push(at),
            ChangeEvent::RowMoved { from, to } => {
                row_removals.push(from);
                row_insertions.push(to);
            }
            ChangeEvent::RowUpdated { .. } => {}
        }
    }

    row_removals.sort_unstable_by(|a, b| b.cmp(a));
    for at in row_removals {
        let rows = &mut working.get_mut(at.section)?.rows;
        if at.row >= rows.len() {
            return None;
        }
        rows.remove(at.row);
    }

    section_removals.sort_unstable_by(|a, b| b.cmp(a));
    for index in section_removals {
        if index >= working.len() {
            return None;
        }
        working.remove(index);
    }

    section_insertions.sort_unstable();
    for index in section_insertions {
        if index > working.len() {
            return None;
        }
        working.insert(index, target.sections.get(index)?.clone());
    }

    row_insertions.sort_unstable();
    for at in row_insertions {
        let id = target.id_at(at)?.clone();
        let rows = &mut working.get_mut(at.section)?.rows;
        if at.row > rows.len() {
            return None;
        }
        rows.insert(at.row, id);
    }

    Some(working)
}

/// View model of the on-screen list.
pub struct ListPresenter {
    kind: ItemKind,
    filter: Option<String>,
    criterion: Option<GroupingCriterion>,
    sections: Vec<SnapshotSection>,
    failure: Option<String>,
    selected: Option<ItemId>,
    scroll_anchor: Option<ItemId>,
    last_redraw: Redraw,
}

impl ListPresenter {
    pub fn new(kind: ItemKind) -> Self {
        Self {
            kind,
            filter: None,
            criterion: None,
            sections: Vec::new(),
            failure: None,
            selected: None,
            scroll_anchor: None,
            last_redraw: Redraw::None,
        }
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn sections(&self) -> &[SnapshotSection] {
        &self.sections
    }

    pub fn last_redraw(&self) -> &Redraw {
        &self.last_redraw
    }

    /// Context of the list, used by headers and the empty-state explanation.
    pub fn set_context(
        &mut self,
        kind: ItemKind,
        filter: Option<&str>,
        criterion: Option<&GroupingCriterion>,
    ) {
        self.kind = kind;
        self.filter = filter.map(str::to_owned);
        self.criterion = criterion.cloned();
    }

    pub fn state(&self) -> ListState {
        if let Some(message) = &self.failure {
            return ListState::Failed {
                message: message.clone(),
            };
        }
        if self.sections.iter().all(|section| section.rows.is_empty()) {
            return ListState::Empty {
                reason: reason_for_empty(self.kind, self.filter.as_deref(), self.criterion.as_ref()),
            };
        }
        ListState::Rows
    }

    pub fn header(&self, section_index: usize) -> Option<SectionHeader> {
        self.sections
            .get(section_index)
            .map(|section| section_header(section.section, self.kind))
    }

    /// Reconcile one batch of change events. The mode is fixed for the whole batch.
    pub fn apply(
        &mut self,
        events: &[ChangeEvent],
        snapshot: &ResultSnapshot,
        visibility: Visibility,
    ) {
        let selected_path = self.selected_path();
        let anchor_path = self.scroll_anchor_path();
        self.failure = None;

        match visibility {
            Visibility::Background => self.replace_sections(snapshot),
            Visibility::Foreground => {
                match apply_edit_script(&self.sections, events, snapshot) {
                    Some(next) if next == snapshot.sections => {
                        self.sections = next;
                        self.last_redraw = Redraw::Animated(events.to_vec());
                    }
                    _ => {
                        warn!("edit script diverged from snapshot; redrawing list");
                        self.replace_sections(snapshot);
                    }
                }
            }
        }

        let selected = self.selected.take();
        self.selected = self.retarget(selected, selected_path);
        let anchor = self.scroll_anchor.take();
        self.scroll_anchor = self.retarget(anchor, anchor_path);
        debug!(redraw = ?self.last_redraw, "list presented");
    }

    /// Discard positional state and show `snapshot` as is.
    pub fn redraw(&mut self, snapshot: &ResultSnapshot) {
        self.replace_sections(snapshot);
        if self
            .selected
            .as_ref()
            .is_some_and(|id| snapshot.path_of(id).is_none())
        {
            self.selected = None;
        }
    }

    fn replace_sections(&mut self, snapshot: &ResultSnapshot) {
        self.failure = None;
        self.sections = snapshot.sections.clone();
        self.last_redraw = Redraw::Full;
    }

    pub fn show_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
        self.sections.clear();
        self.selected = None;
        self.scroll_anchor = None;
        self.last_redraw = Redraw::Full;
    }

    fn path_of(&self, id: &ItemId) -> Option<RowPath> {
        self.sections.iter().enumerate().find_map(|(s, section)| {
            section
                .rows
                .iter()
                .position(|row| row == id)
                .map(|r| RowPath::new(s, r))
        })
    }

    fn id_at(&self, path: RowPath) -> Option<&ItemId> {
        self.sections.get(path.section)?.rows.get(path.row)
    }

    /// Keep following `id`; if it left the list, take whatever row now sits at
    /// its previous position (clamped to the list).
    fn retarget(&self, id: Option<ItemId>, previous: Option<RowPath>) -> Option<ItemId> {
        let id = id?;
        if self.path_of(&id).is_some() {
            return Some(id);
        }
        let previous = previous?;
        let section = self
            .sections
            .get(previous.section)
            .or_else(|| self.sections.last())?;
        let row = previous.row.min(section.rows.len().checked_sub(1)?);
        section.rows.get(row).cloned()
    }

    pub fn selected(&self) -> Option<&ItemId> {
        self.selected.as_ref()
    }

    pub fn selected_path(&self) -> Option<RowPath> {
        self.selected.as_ref().and_then(|id| self.path_of(id))
    }

    pub fn selected_section(&self) -> Option<Section> {
        self.selected_path()
            .and_then(|path| self.sections.get(path.section))
            .map(|section| section.section)
    }

    pub fn select(&mut self, id: Option<ItemId>) {
        self.selected = id.filter(|id| self.path_of(id).is_some());
    }

    pub fn scroll_anchor_path(&self) -> Option<RowPath> {
        self.scroll_anchor.as_ref().and_then(|id| self.path_of(id))
    }

    pub fn set_scroll_anchor(&mut self, id: Option<ItemId>) {
        self.scroll_anchor = id;
    }

    fn select_path(&mut self, path: RowPath) {
        self.selected = self.id_at(path).cloned();
    }

    fn first_row(&self) -> Option<RowPath> {
        (!self.sections.is_empty() && !self.sections[0].rows.is_empty())
            .then(|| RowPath::new(0, 0))
    }

    pub fn select_next_row(&mut self) {
        let Some(path) = self.selected_path() else {
            if let Some(first) = self.first_row() {
                self.select_path(first);
            }
            return;
        };
        let mut next = RowPath::new(path.section, path.row + 1);
        if next.row >= self.sections[path.section].rows.len() {
            next = RowPath::new(path.section + 1, 0);
            if next.section >= self.sections.len() {
                return;
            }
        }
        self.select_path(next);
    }

    pub fn select_previous_row(&mut self) {
        let Some(path) = self.selected_path() else {
            if let Some(first) = self.first_row() {
                self.select_path(first);
            }
            return;
        };
        let previous = if path.row > 0 {
            RowPath::new(path.section, path.row - 1)
        } else if path.section > 0 {
            let section = path.section - 1;
            let rows = self.sections[section].rows.len();
            RowPath::new(section, rows.saturating_sub(1))
        } else {
            return;
        };
        self.select_path(previous);
    }

    pub fn select_next_section(&mut self) {
        let Some(path) = self.selected_path() else {
            if let Some(first) = self.first_row() {
                self.select_path(first);
            }
            return;
        };
        if path.section + 1 < self.sections.len() {
            self.select_path(RowPath::new(path.section + 1, 0));
        }
    }

    pub fn select_previous_section(&mut self) {
        let Some(path) = self.selected_path() else {
            if let Some(first) = self.first_row() {
                self.select_path(first);
            }
            return;
        };
        if path.section > 0 {
            self.select_path(RowPath::new(path.section - 1, 0));
        }
    }
}
