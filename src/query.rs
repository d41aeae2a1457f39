use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::{GroupingCriterion, Item, ItemKind, Section, criterion_matches};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Updated,
    Created,
    Title,
}

/// Filter, sort and grouping specification for one list.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemQuery {
    pub kind: ItemKind,
    pub filter: SearchFilter,
    pub criterion: Option<GroupingCriterion>,
    pub only_unread: bool,
    pub section: Option<Section>,
    pub hide_uncommented: bool,
    pub sort: SortField,
    pub sort_descending: bool,
}

/// Items of one section, already in display order.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedSection {
    pub section: Section,
    pub items: Vec<Item>,
}

impl ItemQuery {
    pub fn new(kind: ItemKind) -> Self {
        Self {
            kind,
            filter: SearchFilter::default(),
            criterion: None,
            only_unread: false,
            section: None,
            hide_uncommented: false,
            sort: SortField::Updated,
            sort_descending: true,
        }
    }

    pub fn with_filter(mut self, raw: &str) -> Self {
        self.filter = SearchFilter::new(raw);
        self
    }

    pub fn with_criterion(mut self, criterion: Option<GroupingCriterion>) -> Self {
        self.criterion = criterion;
        self
    }

    pub fn in_section(mut self, section: Section) -> Self {
        self.section = Some(section);
        self
    }

    pub fn only_unread(mut self) -> Self {
        self.only_unread = true;
        self
    }

    pub fn hiding_uncommented(mut self, hide: bool) -> Self {
        self.hide_uncommented = hide;
        self
    }

    pub fn sorted_by(mut self, sort: SortField, descending: bool) -> Self {
        self.sort = sort;
        self.sort_descending = descending;
        self
    }

    pub fn matches(&self, item: &Item) -> bool {
        if item.kind() != self.kind {
            return false;
        }
        let section = item.section();
        if section == Section::None {
            return false;
        }
        if let Some(wanted) = self.section
            && wanted != section
        {
            return false;
        }
        if !criterion_matches(self.criterion.as_ref(), item) {
            return false;
        }
        if self.only_unread && !item.counts_as_unread() {
            return false;
        }
        if self.hide_uncommented && item.comments.is_empty() {
            return false;
        }
        self.filter.matches(item)
    }

    /// Apply the query to a set of items: filter, bucket by section, sort.
    pub fn evaluate<'a>(&self, items: impl IntoIterator<Item = &'a Item>) -> Vec<FetchedSection> {
        let mut buckets: Vec<FetchedSection> = Section::VISIBLE
            .into_iter()
            .map(|section| FetchedSection {
                section,
                items: Vec::new(),
            })
            .collect();

        for item in items {
            if !self.matches(item) {
                continue;
            }
            let section = item.section();
            if let Some(bucket) = buckets.iter_mut().find(|bucket| bucket.section == section) {
                bucket.items.push(item.clone());
            }
        }

        buckets.retain(|bucket| !bucket.items.is_empty());
        for bucket in &mut buckets {
            bucket.items.sort_by(|a, b| self.compare(a, b));
        }
        buckets
    }

    fn compare(&self, a: &Item, b: &Item) -> Ordering {
        let primary = match self.sort {
            SortField::Updated => a.updated_at.cmp(&b.updated_at),
            SortField::Created => a.created_at.cmp(&b.created_at),
            SortField::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        };
        let primary = if self.sort_descending {
            primary.reverse()
        } else {
            primary
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

// -----------------------------------------------------------------------------
// Search filtering
// -----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum FilterTerm {
    Any(String),
    Title(String),
    Repo(String),
    Label(String),
    User(String),
    Number(u64),
}

impl FilterTerm {
    fn parse(token: &str) -> Self {
        let lowered = token.to_lowercase();
        let targeted = lowered.split_once(':').and_then(|(prefix, value)| {
            if value.is_empty() {
                return None;
            }
            let value = value.to_owned();
            match prefix {
                "title" => Some(FilterTerm::Title(value)),
                "repo" => Some(FilterTerm::Repo(value)),
                "label" => Some(FilterTerm::Label(value)),
                "user" => Some(FilterTerm::User(value)),
                "number" => value
                    .trim_start_matches('#')
                    .parse()
                    .ok()
                    .map(FilterTerm::Number),
                _ => None,
            }
        });
        targeted.unwrap_or(FilterTerm::Any(lowered))
    }

    fn matches(&self, item: &Item) -> bool {
        match self {
            FilterTerm::Any(needle) => {
                item.title.to_lowercase().contains(needle)
                    || item.body.to_lowercase().contains(needle)
            }
            FilterTerm::Title(needle) => item.title.to_lowercase().contains(needle),
            FilterTerm::Repo(needle) => item.repo.full_name.to_lowercase().contains(needle),
            FilterTerm::Label(needle) => item
                .labels
                .iter()
                .any(|label| label.name.to_lowercase().contains(needle)),
            FilterTerm::User(needle) => item.author.to_lowercase().contains(needle),
            FilterTerm::Number(number) => item.number == *number,
        }
    }
}

/// Free-text filter. Every whitespace-separated term has to match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchFilter {
    raw: Option<String>,
    terms: Vec<FilterTerm>,
}

impl SearchFilter {
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::default();
        }
        Self {
            raw: Some(trimmed.to_owned()),
            terms: trimmed.split_whitespace().map(FilterTerm::parse).collect(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.terms.iter().all(|term| term.matches(item))
    }
}

/// Explanation shown instead of an empty list.
pub fn reason_for_empty(
    kind: ItemKind,
    filter: Option<&str>,
    criterion: Option<&GroupingCriterion>,
) -> String {
    let scope = criterion
        .map(|criterion| format!(" in '{}'", criterion.label()))
        .unwrap_or_default();
    match filter.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => format!("There are no {}{scope} matching '{text}'.", kind.plural()),
        None => format!(
            "There are no {}{scope} in your watched repositories.",
            kind.plural()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::*;
    use crate::domain::{Involvement, ItemCondition, Label};

    #[test]
    fn plain_terms_match_title_or_body() {
        let a = pr("1", "Bugfix for login");
        let mut b = pr("2", "Refactor");
        b.body = "contains a BUGFIX too".to_owned();
        let c = pr("3", "Docs");
        let filter = SearchFilter::new("  bugfix ");
        assert!(filter.matches(&a));
        assert!(filter.matches(&b));
        assert!(!filter.matches(&c));
        assert_eq!(filter.text(), Some("bugfix"));
    }

    #[test]
    fn prefixed_terms_target_single_fields() {
        let mut item = pr("1", "Bugfix");
        item.number = 42;
        item.labels.push(Label {
            name: "Needs Review".to_owned(),
            color: "00ff00".to_owned(),
        });
        assert!(SearchFilter::new("number:#42 label:review").matches(&item));
        assert!(SearchFilter::new("repo:widgets user:octo").matches(&item));
        assert!(!SearchFilter::new("title:docs").matches(&item));
        assert!(!SearchFilter::new("number:7").matches(&item));
    }

    #[test]
    fn evaluate_buckets_in_section_order_and_sorts() {
        let mut merged = pr("m", "Merged one");
        merged.condition = ItemCondition::Merged;
        let mut older = pr("a", "Older");
        older.updated_at = at(1);
        let mut newer = pr("b", "Newer");
        newer.updated_at = at(9);
        let mut other = pr("o", "Other");
        other.involvement = Involvement::Other;
        let an_issue = issue("i", "Not a PR");

        let items = [merged, older, newer, other, an_issue];
        let sections = ItemQuery::new(ItemKind::PullRequest).evaluate(items.iter());

        let layout: Vec<(Section, Vec<&str>)> = sections
            .iter()
            .map(|s| (s.section, s.items.iter().map(|i| i.id.as_str()).collect()))
            .collect();
        assert_eq!(
            layout,
            vec![
                (Section::Mine, vec!["b", "a"]),
                (Section::Merged, vec!["m"]),
                (Section::All, vec!["o"]),
            ]
        );
    }

    #[test]
    fn only_unread_excludes_muted() {
        let mut loud = pr("1", "Loud");
        loud.alert = true;
        let mut muted = pr("2", "Muted");
        muted.alert = true;
        muted.muted = true;
        let query = ItemQuery::new(ItemKind::PullRequest).only_unread();
        assert!(query.matches(&loud));
        assert!(!query.matches(&muted));
    }

    #[test]
    fn reasons_mention_filter_and_criterion() {
        let group = GroupingCriterion::RepoGroup("team-a".to_owned());
        assert_eq!(
            reason_for_empty(ItemKind::Issue, Some("crash"), Some(&group)),
            "There are no issues in 'team-a' matching 'crash'."
        );
        assert_eq!(
            reason_for_empty(ItemKind::PullRequest, Some("  "), None),
            "There are no pull requests in your watched repositories."
        );
    }
}
