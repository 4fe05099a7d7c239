//! Completion candidates: item model, kind abbreviations and ranking.

/// Most candidates handed to a completion menu at once.
pub const MAX_CANDIDATES: usize = 20;

/// The LSP `CompletionItemKind` values (1..=18).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompletionKind {
    Text = 1,
    Method = 2,
    Function = 3,
    Constructor = 4,
    Field = 5,
    Variable = 6,
    Class = 7,
    Interface = 8,
    Module = 9,
    Property = 10,
    Unit = 11,
    Value = 12,
    Enum = 13,
    Keyword = 14,
    Snippet = 15,
    Color = 16,
    File = 17,
    Reference = 18,
}

impl CompletionKind {
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        Some(match value {
            1 => Self::Text,
            2 => Self::Method,
            3 => Self::Function,
            4 => Self::Constructor,
            5 => Self::Field,
            6 => Self::Variable,
            7 => Self::Class,
            8 => Self::Interface,
            9 => Self::Module,
            10 => Self::Property,
            11 => Self::Unit,
            12 => Self::Value,
            13 => Self::Enum,
            14 => Self::Keyword,
            15 => Self::Snippet,
            16 => Self::Color,
            17 => Self::File,
            18 => Self::Reference,
            _ => return None,
        })
    }

    /// One-letter tag shown beside a candidate.
    #[must_use]
    pub fn abbreviation(self) -> char {
        match self {
            Self::Text => 't',
            Self::Method | Self::Module => 'm',
            Self::Function | Self::Field | Self::File | Self::Reference => 'f',
            Self::Constructor | Self::Class | Self::Color => 'c',
            Self::Variable | Self::Value => 'v',
            Self::Interface => 'i',
            Self::Property => 'p',
            Self::Unit => 'u',
            Self::Enum => 'e',
            Self::Keyword => 'k',
            Self::Snippet => 's',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionItem {
    pub label: String,
    pub kind: Option<CompletionKind>,
    pub documentation: Option<String>,
}

impl CompletionItem {
    /// Kind used for ordering; items without one sort as plain text.
    #[must_use]
    pub fn effective_kind(&self) -> CompletionKind {
        self.kind.unwrap_or(CompletionKind::Text)
    }

    /// Documentation, falling back to the label.
    #[must_use]
    pub fn info(&self) -> &str {
        self.documentation.as_deref().unwrap_or(&self.label)
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Find where the identifier ending at byte `column` of `line` starts.
///
/// Returns the start byte offset and the typed prefix. `column` past the
/// end of the line is clamped; a column inside a multi-byte character is
/// moved back to its start.
#[must_use]
pub fn word_start(line: &str, column: usize) -> (usize, &str) {
    let mut end = column.min(line.len());
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    let start = line[..end]
        .char_indices()
        .rev()
        .take_while(|&(_, c)| is_word_char(c))
        .last()
        .map_or(end, |(i, _)| i);
    (start, &line[start..end])
}

/// Pick the candidates to show for `prefix`.
///
/// With no prefix the server's list is ordered by kind (stable) and cut
/// to [`MAX_CANDIDATES`]; otherwise only labels starting with `prefix`
/// survive, in server order.
#[must_use]
pub fn rank_candidates(mut items: Vec<CompletionItem>, prefix: &str) -> Vec<CompletionItem> {
    let total = items.len();
    if prefix.is_empty() {
        items.sort_by_key(CompletionItem::effective_kind);
    } else {
        items.retain(|item| item.label.starts_with(prefix));
    }
    items.truncate(MAX_CANDIDATES);
    tracing::debug!(
        total,
        kept = items.len(),
        prefix,
        "Ranked completion candidates"
    );
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(label: &str, kind: Option<CompletionKind>) -> CompletionItem {
        CompletionItem {
            label: label.to_string(),
            kind,
            documentation: None,
        }
    }

    #[test]
    fn kinds_round_trip_from_wire() {
        for value in 1..=18 {
            let kind = CompletionKind::from_lsp(value).unwrap();
            assert_eq!(kind as u64, value);
        }
        assert_eq!(CompletionKind::from_lsp(0), None);
        assert_eq!(CompletionKind::from_lsp(19), None);
    }

    #[test]
    fn abbreviations() {
        let tags: String = (1..=18)
            .map(|v| CompletionKind::from_lsp(v).unwrap().abbreviation())
            .collect();
        assert_eq!(tags, "tmfcfvcimpuvekscff");
    }

    #[test]
    fn word_start_finds_identifier() {
        assert_eq!(word_start("  foo_bar1", 10), (2, "foo_bar1"));
        assert_eq!(word_start("x.len", 5), (2, "len"));
        assert_eq!(word_start("x.", 2), (2, ""));
        assert_eq!(word_start("", 0), (0, ""));
    }

    #[test]
    fn word_start_clamps_column() {
        assert_eq!(word_start("abc", 99), (0, "abc"));
        // Column 2 falls inside the two-byte 'é'.
        assert_eq!(word_start("aéb", 2), (0, "a"));
    }

    #[test]
    fn rank_without_prefix_sorts_by_kind_and_caps() {
        let mut items: Vec<_> = (0..30)
            .map(|i| item(&format!("v{i}"), Some(CompletionKind::Variable)))
            .collect();
        items.push(item("kw", Some(CompletionKind::Keyword)));
        items.push(item("plain", None));
        items.push(item("fn", Some(CompletionKind::Function)));

        let ranked = rank_candidates(items, "");
        assert_eq!(ranked.len(), MAX_CANDIDATES);
        assert_eq!(ranked[0].label, "plain");
        assert_eq!(ranked[1].label, "fn");
        assert_eq!(ranked[2].label, "v0");
        assert_eq!(ranked[3].label, "v1");
    }

    #[test]
    fn rank_with_prefix_filters_in_server_order() {
        let items = vec![
            item("print", Some(CompletionKind::Function)),
            item("main", Some(CompletionKind::Function)),
            item("printf", Some(CompletionKind::Keyword)),
        ];
        let ranked = rank_candidates(items, "pri");
        let labels: Vec<_> = ranked.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, ["print", "printf"]);
    }

    #[test]
    fn info_falls_back_to_label() {
        let mut it = item("x", None);
        assert_eq!(it.info(), "x");
        it.documentation = Some("doc".into());
        assert_eq!(it.info(), "doc");
    }
}
