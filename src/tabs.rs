use tracing::debug;

use crate::{
    domain::{GroupingCriterion, Item, ItemKind, criterion_matches},
    query::ItemQuery,
    store::{ItemSource, StoreError, badge_count},
};

/// One navigable tab: a criterion shown with one item kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabEntry {
    pub criterion: Option<GroupingCriterion>,
    pub kind: ItemKind,
    pub badge: usize,
}

impl TabEntry {
    pub fn title(&self) -> String {
        match &self.criterion {
            Some(criterion) => format!("{} · {}", criterion.label(), self.kind.label()),
            None => self.kind.label().to_owned(),
        }
    }

    /// Badge text; a zero count shows no badge.
    pub fn badge_label(&self) -> Option<String> {
        (self.badge > 0).then(|| self.badge.to_string())
    }
}

/// A grouping criterion with the tabs it produced (zero, one or two).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabDescriptor {
    pub criterion: Option<GroupingCriterion>,
    pub entries: Vec<TabEntry>,
}

#[derive(Debug, Default)]
pub struct TabModel {
    descriptors: Vec<TabDescriptor>,
    tabs: Vec<TabEntry>,
    selected: Option<usize>,
    last_tab_index: usize,
}

impl TabModel {
    pub fn new(last_tab_index: usize) -> Self {
        Self {
            last_tab_index,
            ..Self::default()
        }
    }

    /// Enumerate criteria and emit one entry per kind that has content.
    pub fn rebuild<S: ItemSource + ?Sized>(
        &mut self,
        source: &S,
        separate_servers: bool,
    ) -> Result<(), StoreError> {
        let mut criteria: Vec<Option<GroupingCriterion>> = source
            .repo_groups()?
            .into_iter()
            .map(|group| Some(GroupingCriterion::RepoGroup(group)))
            .collect();
        if separate_servers {
            criteria.extend(
                source
                    .servers()?
                    .into_iter()
                    .filter(|server| server.good_to_go)
                    .map(|server| {
                        Some(GroupingCriterion::Server {
                            id: server.id,
                            label: server.label,
                        })
                    }),
            );
        } else {
            criteria.push(None);
        }

        let mut descriptors = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            let mut entries = Vec::with_capacity(2);
            for kind in [ItemKind::PullRequest, ItemKind::Issue] {
                let query = ItemQuery::new(kind).with_criterion(criterion.clone());
                if source.count(&query)? == 0 {
                    continue;
                }
                entries.push(TabEntry {
                    criterion: criterion.clone(),
                    kind,
                    badge: badge_count(source, kind, criterion.as_ref())?,
                });
            }
            descriptors.push(TabDescriptor { criterion, entries });
        }

        self.tabs = descriptors
            .iter()
            .flat_map(|descriptor| descriptor.entries.iter().cloned())
            .collect();
        self.descriptors = descriptors;
        self.selected = match self.tabs.len() {
            0 => None,
            len if self.last_tab_index < len => Some(self.last_tab_index),
            len => Some(len - 1),
        };
        debug!(
            tabs = self.tabs.len(),
            selected = ?self.selected,
            "tabs rebuilt"
        );
        Ok(())
    }

    pub fn descriptors(&self) -> &[TabDescriptor] {
        &self.descriptors
    }

    pub fn tabs(&self) -> &[TabEntry] {
        &self.tabs
    }

    /// With at most one entry there is nothing to switch between.
    pub fn tabs_hidden(&self) -> bool {
        self.tabs.len() <= 1
    }

    /// No criterion has any content at all.
    pub fn show_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    pub fn last_tab_index(&self) -> usize {
        self.last_tab_index
    }

    /// The entry the list currently shows; the only entry when tabs are hidden.
    pub fn current(&self) -> Option<&TabEntry> {
        self.selected.and_then(|index| self.tabs.get(index))
    }

    pub fn viewing_kind(&self) -> Option<ItemKind> {
        self.current().map(|tab| tab.kind)
    }

    pub fn select(&mut self, index: usize) -> Option<&TabEntry> {
        if index >= self.tabs.len() {
            return None;
        }
        self.selected = Some(index);
        self.last_tab_index = index;
        self.tabs.get(index)
    }

    pub fn select_next(&mut self) -> Option<&TabEntry> {
        let len = self.tabs.len();
        if len == 0 {
            return None;
        }
        let next = self.selected.map_or(0, |index| (index + 1) % len);
        self.select(next)
    }

    pub fn select_previous(&mut self) -> Option<&TabEntry> {
        let len = self.tabs.len();
        if len == 0 {
            return None;
        }
        let previous = self
            .selected
            .map_or(len - 1, |index| (index + len - 1) % len);
        self.select(previous)
    }

    /// Switch to the tab an item belongs to, if one exists.
    pub fn select_for_item(&mut self, item: &Item) -> Option<&TabEntry> {
        let index = self.tabs.iter().position(|tab| {
            tab.kind == item.kind() && criterion_matches(tab.criterion.as_ref(), item)
        })?;
        self.select(index)
    }
}
