//! Core record model, identifier normalization and reply-tree flattening for RDC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rdc-core";

/// Literal stored in `author` columns for accounts that no longer exist.
pub const DELETED_AUTHOR: &str = "[deleted]";

/// Body marker used by automated moderator replies.
pub const BOT_NOTICE_MARKER: &str = "I am a bot";

/// Type of a prefixed platform identifier ("fullname").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThingKind {
    Comment,
    Post,
}

impl ThingKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ThingKind::Comment => "t1_",
            ThingKind::Post => "t3_",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "t1_" => Some(ThingKind::Comment),
            "t3_" => Some(ThingKind::Post),
            _ => None,
        }
    }
}

/// A bare identifier plus the kind its prefix announced, if any.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedId {
    pub id: String,
    pub kind: Option<ThingKind>,
}

impl NormalizedId {
    pub fn is_post(&self) -> bool {
        self.kind == Some(ThingKind::Post)
    }

    pub fn is_comment(&self) -> bool {
        self.kind == Some(ThingKind::Comment)
    }
}

/// Strip a `t1_`/`t3_` prefix and report which one was present.
///
/// Missing or empty input yields `None`. Unknown prefixes are left in place and
/// the identifier is treated as already bare. A prefix with nothing after it
/// also yields `None`, since it cannot key a row.
pub fn normalize_id(raw: Option<&str>) -> Option<NormalizedId> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }

    if let (Some(prefix), Some(rest)) = (raw.get(..3), raw.get(3..)) {
        if let Some(kind) = ThingKind::from_prefix(prefix) {
            if rest.is_empty() {
                return None;
            }
            return Some(NormalizedId {
                id: rest.to_string(),
                kind: Some(kind),
            });
        }
    }

    Some(NormalizedId {
        id: raw.to_string(),
        kind: None,
    })
}

/// Bare identifier only; see [`normalize_id`].
pub fn canonical_id(raw: Option<&str>) -> Option<String> {
    normalize_id(raw).map(|n| n.id)
}

/// Author of a post or comment. Removed accounts are tracked as a variant rather than a magic name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Author {
    Known(String),
    #[default]
    Deleted,
}

impl Author {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) if !name.is_empty() && name != DELETED_AUTHOR => {
                Author::Known(name.to_string())
            }
            _ => Author::Deleted,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Author::Known(name) => Some(name),
            Author::Deleted => None,
        }
    }

    /// Value written to the `author` column.
    pub fn as_stored(&self) -> &str {
        self.name().unwrap_or(DELETED_AUTHOR)
    }
}

impl From<Option<String>> for Author {
    fn from(value: Option<String>) -> Self {
        Author::from_name(value.as_deref())
    }
}

impl From<Author> for Option<String> {
    fn from(value: Author) -> Self {
        match value {
            Author::Known(name) => Some(name),
            Author::Deleted => None,
        }
    }
}

/// A submission as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub subreddit: String,
    pub title: String,
    pub body: Option<String>,
    pub author: Author,
    pub created_utc: i64,
    pub score: i64,
}

impl Post {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created_utc, 0)
    }
}

/// One node of a fetched reply tree. References keep their platform prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentNode {
    pub id: String,
    pub body: Option<String>,
    pub author: Author,
    pub created_utc: i64,
    pub parent_ref: Option<String>,
    pub link_ref: Option<String>,
    pub score: i64,
    #[serde(default)]
    pub replies: Vec<CommentNode>,
}

/// Flattened comment, still carrying raw (prefixed) parent and link references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatComment {
    pub id: String,
    pub body: String,
    pub author: Author,
    pub created_utc: i64,
    pub parent_ref: Option<String>,
    pub link_ref: Option<String>,
    pub score: i64,
}

impl FlatComment {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created_utc, 0)
    }
}

/// Decides which comment bodies are kept when flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentFilter {
    markers: Vec<String>,
}

impl Default for CommentFilter {
    fn default() -> Self {
        Self {
            markers: vec![BOT_NOTICE_MARKER.to_string()],
        }
    }
}

impl CommentFilter {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn admits(&self, body: Option<&str>) -> bool {
        match body {
            Some(body) if !body.is_empty() => {
                !self.markers.iter().any(|marker| body.contains(marker.as_str()))
            }
            _ => false,
        }
    }
}

/// Flatten a reply tree depth-first, parent before children.
///
/// Rejected nodes are skipped but their replies are still visited. The walk uses
/// an explicit stack of sibling iterators so tree depth never grows the call stack.
pub fn flatten_comment_tree(roots: &[CommentNode], filter: &CommentFilter) -> Vec<FlatComment> {
    let mut out = Vec::new();
    let mut stack = vec![roots.iter()];

    while let Some(siblings) = stack.last_mut() {
        let Some(node) = siblings.next() else {
            stack.pop();
            continue;
        };

        if filter.admits(node.body.as_deref()) {
            out.push(FlatComment {
                id: node.id.clone(),
                body: node.body.clone().unwrap_or_default(),
                author: node.author.clone(),
                created_utc: node.created_utc,
                parent_ref: node.parent_ref.clone(),
                link_ref: node.link_ref.clone(),
                score: node.score,
            });
        }

        if !node.replies.is_empty() {
            stack.push(node.replies.iter());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, body: Option<&str>, parent: &str, replies: Vec<CommentNode>) -> CommentNode {
        CommentNode {
            id: id.to_string(),
            body: body.map(str::to_string),
            author: Author::Known("someone".into()),
            created_utc: 1_700_000_000,
            parent_ref: Some(parent.to_string()),
            link_ref: Some("t3_post".to_string()),
            score: 1,
            replies,
        }
    }

    fn ids(flat: &[FlatComment]) -> Vec<&str> {
        flat.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn prefixes_are_stripped_and_classified() {
        let comment = normalize_id(Some("t1_abc123")).expect("comment id");
        assert_eq!(comment.id, "abc123");
        assert!(comment.is_comment());

        let post = normalize_id(Some("t3_xyz789")).expect("post id");
        assert_eq!(post.id, "xyz789");
        assert!(post.is_post());

        assert_eq!(normalize_id(None), None);
        assert_eq!(normalize_id(Some("")), None);
        assert_eq!(normalize_id(Some("t1_")), None);
    }

    #[test]
    fn unknown_prefixes_pass_through() {
        let account = normalize_id(Some("t2_abc")).expect("id");
        assert_eq!(account.id, "t2_abc");
        assert_eq!(account.kind, None);

        assert_eq!(canonical_id(Some("abc")), Some("abc".to_string()));
        assert_eq!(canonical_id(Some("ab")), Some("ab".to_string()));
    }

    #[test]
    fn deleted_authors_round_trip_through_stored_literal() {
        assert_eq!(Author::from_name(None), Author::Deleted);
        assert_eq!(Author::from_name(Some("[deleted]")), Author::Deleted);
        assert_eq!(Author::Deleted.as_stored(), "[deleted]");
        assert_eq!(Author::from_name(Some("alice")).as_stored(), "alice");

        let json = serde_json::to_string(&Author::Deleted).expect("serialize");
        assert_eq!(json, "null");
        let back: Author = serde_json::from_str("\"bob\"").expect("deserialize");
        assert_eq!(back, Author::Known("bob".into()));
    }

    #[test]
    fn flattening_is_parent_before_children() {
        let tree = vec![
            node(
                "a",
                Some("root a"),
                "t3_post",
                vec![
                    node("a1", Some("reply"), "t1_a", vec![node("a1x", Some("deep"), "t1_a1", vec![])]),
                    node("a2", Some("reply"), "t1_a", vec![]),
                ],
            ),
            node("b", Some("root b"), "t3_post", vec![]),
        ];

        let flat = flatten_comment_tree(&tree, &CommentFilter::default());
        assert_eq!(ids(&flat), vec!["a", "a1", "a1x", "a2", "b"]);
        assert_eq!(flat[1].parent_ref.as_deref(), Some("t1_a"));
        assert_eq!(flat[0].link_ref.as_deref(), Some("t3_post"));
    }

    #[test]
    fn bot_notices_are_dropped_but_their_replies_survive() {
        let tree = vec![node(
            "bot",
            Some("Your post was removed. I am a bot, and this action was performed automatically."),
            "t3_post",
            vec![
                node("human", Some("thanks bot"), "t1_bot", vec![]),
                node("empty", None, "t1_bot", vec![node("nested", Some("still here"), "t1_empty", vec![])]),
                node("blank", Some(""), "t1_bot", vec![]),
            ],
        )];

        let flat = flatten_comment_tree(&tree, &CommentFilter::default());
        assert_eq!(ids(&flat), vec!["human", "nested"]);
    }

    #[test]
    fn custom_markers_replace_the_default() {
        let filter = CommentFilter::new(["AutoModerator says"]);
        assert!(filter.admits(Some("I am a bot")));
        assert!(!filter.admits(Some("AutoModerator says hi")));
        assert!(!filter.admits(None));
    }

    #[test]
    fn deep_chains_flatten_without_recursion() {
        let depth = 1_000;
        let mut current = node("c0", Some("leaf"), "t1_c1", vec![]);
        for i in 1..depth {
            current = node(&format!("c{i}"), Some("link"), "t1_parent", vec![current]);
        }
        let flat = flatten_comment_tree(std::slice::from_ref(&current), &CommentFilter::default());
        assert_eq!(flat.len(), depth);
        assert_eq!(flat.first().map(|c| c.id.as_str()), Some("c999"));
        assert_eq!(flat.last().map(|c| c.id.as_str()), Some("c0"));
    }

    #[test]
    fn post_timestamps_convert_to_utc() {
        let post = Post {
            id: "xyz".into(),
            subreddit: "pennystocks".into(),
            title: "t".into(),
            body: None,
            author: Author::Deleted,
            created_utc: 0,
            score: 0,
        };
        assert_eq!(post.created_at().map(|d| d.timestamp()), Some(0));
    }
}
