//! Routes row actions, keyboard shortcuts and deep links to item mutations.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    domain::{GroupingCriterion, Item, ItemId, ItemKind, Section},
    presenter::{RowAction, row_actions},
    query::ItemQuery,
    storage::Settings,
    store::{ItemStore, StoreError},
    sync::SyncEngine,
};

const COMMENT_REFERENCE_PREFIX: &str = "comment:";

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{action} not available")]
    Unavailable { action: &'static str },
    #[error("no snooze presets configured")]
    NoSnoozePresets,
    #[error("item not found")]
    ItemNotFound,
    #[error("item has no destination URL")]
    NoDestination,
    #[error("no network connectivity")]
    NoNetwork,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    /// Short `(title, message)` pair for the user.
    pub fn user_message(&self) -> (String, String) {
        match self {
            ActionError::Unavailable { action } => (
                format!("{action} not available"),
                "This command cannot be used on this item".to_owned(),
            ),
            ActionError::NoSnoozePresets => (
                "You do not currently have any snoozing presets configured".to_owned(),
                "Please add some in the relevant preferences tab.".to_owned(),
            ),
            ActionError::ItemNotFound => (
                "Item not found".to_owned(),
                "Could not locate the item related to this notification".to_owned(),
            ),
            ActionError::NoDestination => (
                "Cannot open item".to_owned(),
                "This item has no web address".to_owned(),
            ),
            ActionError::NoNetwork => (
                "No Network".to_owned(),
                "There is no network connectivity, please try again later".to_owned(),
            ),
            ActionError::Store(err) => ("Update failed".to_owned(), err.to_string()),
        }
    }
}

/// Keyboard shortcuts that toggle item state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shortcut {
    ToggleRead,
    ToggleMute,
    ToggleSnooze,
}

/// A destructive request parked until the user confirms it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingAction {
    RemoveAll {
        kind: ItemKind,
        section: Section,
        criterion: Option<GroupingCriterion>,
    },
    MarkAllRead {
        ids: Vec<ItemId>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub title: String,
    pub message: String,
    pub action: PendingAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Removed(usize),
    MarkedRead(usize),
    Confirm(Confirmation),
    ChooseSnooze { item: ItemId, choices: Vec<String> },
    OpenUrl(String),
    ShowDetail(ItemId),
    /// Navigate to an item resolved from a deep link.
    Reveal { item: ItemId, url: Option<String> },
    Refreshing(u64),
}

pub struct ActionRouter<'a, S: ItemStore + ?Sized> {
    store: &'a S,
    settings: &'a Settings,
    now: DateTime<Utc>,
}

impl<'a, S: ItemStore + ?Sized> ActionRouter<'a, S> {
    pub fn new(store: &'a S, settings: &'a Settings, now: DateTime<Utc>) -> Self {
        Self {
            store,
            settings,
            now,
        }
    }

    fn load(&self, id: &ItemId) -> Result<Item, ActionError> {
        self.store.item(id)?.ok_or(ActionError::ItemNotFound)
    }

    pub fn mark_read(&self, id: &ItemId) -> Result<Outcome, ActionError> {
        if !self.load(id)?.has_unread_comments_or_alert() {
            return Err(ActionError::Unavailable { action: "Read" });
        }
        let now = self.now;
        self.store.update(id, &mut |item| item.mark_read(now))?;
        Ok(Outcome::Done)
    }

    pub fn mark_unread(&self, id: &ItemId) -> Result<Outcome, ActionError> {
        if self.load(id)?.has_unread_comments_or_alert() {
            return Err(ActionError::Unavailable { action: "Unread" });
        }
        self.store.update(id, &mut Item::mark_unread)?;
        Ok(Outcome::Done)
    }

    pub fn toggle_mute(&self, id: &ItemId) -> Result<Outcome, ActionError> {
        let muted = self.load(id)?.muted;
        self.store.update(id, &mut |item| item.set_mute(!muted))?;
        Ok(Outcome::Done)
    }

    /// Snooze with the preset at `preset`, or ask which preset to use.
    pub fn snooze(&self, id: &ItemId, preset: Option<usize>) -> Result<Outcome, ActionError> {
        if self.load(id)?.is_snoozing() {
            return Err(ActionError::Unavailable { action: "Snooze" });
        }
        let presets = &self.settings.snooze_presets;
        if presets.is_empty() {
            return Err(ActionError::NoSnoozePresets);
        }
        let Some(index) = preset else {
            return Ok(Outcome::ChooseSnooze {
                item: id.clone(),
                choices: presets.iter().map(|p| p.list_description()).collect(),
            });
        };
        let preset = presets
            .get(index)
            .ok_or(ActionError::Unavailable { action: "Snooze" })?;
        let now = self.now;
        self.store.update(id, &mut |item| item.snooze(preset, now))?;
        Ok(Outcome::Done)
    }

    pub fn wake(&self, id: &ItemId) -> Result<Outcome, ActionError> {
        if !self.load(id)?.is_snoozing() {
            return Err(ActionError::Unavailable { action: "Wake" });
        }
        self.store.update(id, &mut Item::wake)?;
        Ok(Outcome::Done)
    }

    pub fn remove(&self, id: &ItemId) -> Result<Outcome, ActionError> {
        let item = self.load(id)?;
        if !item.section().is_terminal(item.kind()) {
            return Err(ActionError::Unavailable { action: "Remove" });
        }
        let removed = self.store.delete(std::slice::from_ref(id))?;
        Ok(Outcome::Removed(removed))
    }

    /// Bulk-delete a terminal section under a criterion.
    pub fn remove_all(
        &self,
        kind: ItemKind,
        section: Section,
        criterion: Option<&GroupingCriterion>,
        confirmed: bool,
    ) -> Result<Outcome, ActionError> {
        let dont_ask = match section {
            Section::Merged if kind == ItemKind::PullRequest => {
                self.settings.dont_ask_before_wiping_merged
            }
            Section::Closed => self.settings.dont_ask_before_wiping_closed,
            _ => return Err(ActionError::Unavailable { action: "Remove all" }),
        };
        if !confirmed && !dont_ask {
            return Ok(Outcome::Confirm(Confirmation {
                title: "Sure?".to_owned(),
                message: format!(
                    "Remove all {} in the {} section?",
                    kind.plural(),
                    section.display_name(kind)
                ),
                action: PendingAction::RemoveAll {
                    kind,
                    section,
                    criterion: criterion.cloned(),
                },
            }));
        }

        let query = ItemQuery::new(kind)
            .with_criterion(criterion.cloned())
            .in_section(section);
        let ids: Vec<ItemId> = self
            .store
            .fetch(&query)?
            .into_iter()
            .flat_map(|bucket| bucket.items)
            .map(|item| item.id)
            .collect();
        let removed = self.store.delete(&ids)?;
        info!(removed, section = ?section, "removed items");
        Ok(Outcome::Removed(removed))
    }

    /// Mark every listed item read, after a prompt naming the scope.
    pub fn mark_all_read(
        &self,
        ids: &[ItemId],
        kind: ItemKind,
        criterion: Option<&GroupingCriterion>,
        confirmed: bool,
    ) -> Result<Outcome, ActionError> {
        if !confirmed {
            let scope = criterion
                .map(|criterion| format!(" in '{}'", criterion.label()))
                .unwrap_or_default();
            return Ok(Outcome::Confirm(Confirmation {
                title: format!("Mark all {}{scope} as read?", kind.plural()),
                message: "This will mark every item currently listed as read.".to_owned(),
                action: PendingAction::MarkAllRead { ids: ids.to_vec() },
            }));
        }
        self.mark_read_many(ids)
    }

    fn mark_read_many(&self, ids: &[ItemId]) -> Result<Outcome, ActionError> {
        let now = self.now;
        let touched = self.store.update_many(ids, &mut |item| item.mark_read(now))?;
        Ok(Outcome::MarkedRead(touched))
    }

    /// Mark read those of `ids` that are unread; the rest are left untouched.
    pub fn mark_items_read(&self, ids: &[ItemId]) -> Result<Outcome, ActionError> {
        let mut unread = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.store.item(id)?
                && item.has_unread_comments_or_alert()
            {
                unread.push(item.id);
            }
        }
        self.mark_read_many(&unread)
    }

    pub fn mark_everything_read(&self) -> Result<Outcome, ActionError> {
        let unread: Vec<ItemId> = self
            .store
            .snapshot()?
            .all_items()
            .filter(|item| item.has_unread_comments_or_alert())
            .map(|item| item.id.clone())
            .collect();
        self.mark_read_many(&unread)
    }

    /// Remove every item in a terminal section, across all tabs, without asking.
    pub fn clear_all(&self, section: Section) -> Result<Outcome, ActionError> {
        let doomed: Vec<ItemId> = self
            .store
            .snapshot()?
            .all_items()
            .filter(|item| item.section() == section && section.is_terminal(item.kind()))
            .map(|item| item.id.clone())
            .collect();
        let removed = self.store.delete(&doomed)?;
        Ok(Outcome::Removed(removed))
    }

    /// Carry out a request the user confirmed.
    pub fn confirm(&self, pending: &PendingAction) -> Result<Outcome, ActionError> {
        match pending {
            PendingAction::RemoveAll {
                kind,
                section,
                criterion,
            } => self.remove_all(*kind, *section, criterion.as_ref(), true),
            PendingAction::MarkAllRead { ids } => self.mark_read_many(ids),
        }
    }

    /// Open in the browser, or in the detail pane when it can show the item.
    pub fn open(
        &self,
        id: &ItemId,
        force_browser: bool,
        detail_visible: bool,
    ) -> Result<Outcome, ActionError> {
        let item = self.load(id)?;
        let url = item
            .url_for_opening()
            .ok_or(ActionError::NoDestination)?
            .to_owned();
        let external = force_browser
            || (self.settings.open_items_directly_in_browser && !detail_visible);
        if !external {
            return Ok(Outcome::ShowDetail(id.clone()));
        }
        if item.has_unread_comments_or_alert() {
            let now = self.now;
            self.store.update(id, &mut |item| item.mark_read(now))?;
        }
        Ok(Outcome::OpenUrl(url))
    }

    pub fn row_action(
        &self,
        action: RowAction,
        id: &ItemId,
    ) -> Result<Outcome, ActionError> {
        match action {
            RowAction::Read => self.mark_read(id),
            RowAction::Unread => self.mark_unread(id),
            RowAction::Mute | RowAction::Unmute => self.toggle_mute(id),
            RowAction::Snooze => self.snooze(id, None),
            RowAction::Wake => self.wake(id),
            RowAction::Remove => self.remove(id),
        }
    }

    /// A shortcut only acts when the matching row action is offered for the row.
    pub fn shortcut(
        &self,
        shortcut: Shortcut,
        id: &ItemId,
        section: Section,
    ) -> Result<Outcome, ActionError> {
        let item = self.load(id)?;
        let action = match shortcut {
            Shortcut::ToggleRead if item.has_unread_comments_or_alert() => RowAction::Read,
            Shortcut::ToggleRead => RowAction::Unread,
            Shortcut::ToggleMute if item.muted => RowAction::Unmute,
            Shortcut::ToggleMute => RowAction::Mute,
            Shortcut::ToggleSnooze if item.is_snoozing() => RowAction::Wake,
            Shortcut::ToggleSnooze => RowAction::Snooze,
        };
        let offered = row_actions(&item, section, self.settings.show_comments_everywhere);
        if !offered.contains(&action) {
            debug!(?shortcut, ?action, "shortcut refused");
            return Err(ActionError::Unavailable {
                action: action.title(),
            });
        }
        self.row_action(action, id)
    }

    /// Resolve a notification reference (`<item id>` or `comment:<id>`),
    /// apply an optional `mute`/`read` token, then navigate.
    pub fn deep_link(&self, reference: &str, action: Option<&str>) -> Result<Outcome, ActionError> {
        let (item, url) = match reference.strip_prefix(COMMENT_REFERENCE_PREFIX) {
            Some(comment_id) => {
                let item = self
                    .store
                    .comment_parent(comment_id)?
                    .ok_or(ActionError::ItemNotFound)?;
                let url = item
                    .find_comment(comment_id)
                    .and_then(|comment| comment.web_url.clone())
                    .or_else(|| item.url_for_opening().map(str::to_owned));
                (item, url)
            }
            None => {
                let item = self.load(&ItemId::new(reference))?;
                let url = item.url_for_opening().map(str::to_owned);
                (item, url)
            }
        };

        let now = self.now;
        match action {
            Some("mute") => self.store.update(&item.id, &mut |item| item.set_mute(true))?,
            Some("read") => self.store.update(&item.id, &mut |item| item.mark_read(now))?,
            _ => {}
        }
        Ok(Outcome::Reveal { item: item.id, url })
    }

    /// Start a sync, refusing up front when offline.
    pub fn refresh<E: SyncEngine + ?Sized>(&self, sync: &mut E) -> Result<Outcome, ActionError> {
        if !sync.has_network_connection() {
            return Err(ActionError::NoNetwork);
        }
        Ok(Outcome::Refreshing(sync.start_refresh()))
    }
}
