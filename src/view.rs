//! Purely derived presentation of reconciled groups: filter, sort,
//! paginate. No external calls, no state; safe to re-run on every input
//! change, and identical inputs always produce identical pages.

use crate::types::{Group, SortOrder};

#[derive(Clone, Debug, PartialEq)]
pub struct ViewPage {
    pub groups: Vec<Group>,
    /// 1-indexed page actually rendered after clamping.
    pub page: usize,
    pub total_pages: usize,
}

/// Filter matches case-insensitively against seed, quiz title and id, and
/// every winner/source address across a group's linked distributions.
/// Pages are 1-indexed; an out-of-range request clamps into
/// `[1, total_pages]` instead of erroring or coming back empty.
pub fn build_view(
    groups: &[Group],
    filter_text: &str,
    sort: SortOrder,
    page: usize,
    page_size: usize,
) -> ViewPage {
    let needle = filter_text.trim().to_lowercase();

    let mut matched: Vec<Group> = groups
        .iter()
        .filter(|g| needle.is_empty() || matches_filter(g, &needle))
        .cloned()
        .collect();

    // Stable sort keyed by latest_at; seed disambiguates equal timestamps so
    // repeated renders never shuffle.
    matched.sort_by(|a, b| {
        let ord = a.latest_at.cmp(&b.latest_at).then(a.seed.cmp(&b.seed));
        match sort {
            SortOrder::NewestFirst => ord.reverse(),
            SortOrder::OldestFirst => ord,
        }
    });

    let page_size = page_size.max(1);
    let total_pages = matched.len().div_ceil(page_size).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let end = (start + page_size).min(matched.len());
    let groups = if start < matched.len() {
        matched[start..end].to_vec()
    } else {
        Vec::new()
    };

    ViewPage {
        groups,
        page,
        total_pages,
    }
}

fn matches_filter(group: &Group, needle: &str) -> bool {
    if format!("{:#x}", group.seed).contains(needle) {
        return true;
    }
    if let Some(quiz) = &group.quiz {
        if quiz.title.to_lowercase().contains(needle) || quiz.id.to_string().contains(needle) {
            return true;
        }
    }
    group.distributions.iter().any(|d| {
        d.winners
            .iter()
            .chain(std::iter::once(&d.source))
            .any(|a| format!("{a:#x}").contains(needle))
    })
}
