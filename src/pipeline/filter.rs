//! The filter/substitution transform.
//!
//! `transform` is a pure function. Steps run in a fixed order, each one
//! operating on the output of the previous:
//! 1. Filter rules (drop on match)
//! 2. Link unmasking, then rewrite rules and trimming
//! 3. Media substitution
//!
//! Every text change is expressed as a [`TextEdit`] so the remaining
//! formatting entities can be remapped onto the new text.

use std::ops::Range;

use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::rules::{LinkPolicy, RuleSet};
use crate::pipeline::types::{
    Delivery, DropReason, EntityKind, InboundMessage, MessageEntity, OutboundMedia,
    ReplacementAsset, TransformResult,
};

/// Replace `range` of a text with `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub range: Range<usize>,
    pub replacement: String,
}

impl TextEdit {
    pub fn new(range: Range<usize>, replacement: impl Into<String>) -> Self {
        Self {
            range,
            replacement: replacement.into(),
        }
    }
}

/// Media substitution settings.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionPolicy {
    pub enabled: bool,
    /// Only substitute images that carry a caption.
    pub captioned_only: bool,
    /// Where the asset was expected to come from, for error reporting.
    pub asset_path: String,
    pub replacement: Option<ReplacementAsset>,
}

impl SubstitutionPolicy {
    /// Substitution turned off: media always passes through.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Substitute captioned images with `asset`.
    pub fn captioned(asset: ReplacementAsset) -> Self {
        Self {
            enabled: true,
            captioned_only: true,
            asset_path: asset.file_name.clone(),
            replacement: Some(asset),
        }
    }
}

/// Run one message through the pipeline.
///
/// Returns `Err` only for configuration defects (substitution required but
/// no replacement asset); every per-message outcome is a `TransformResult`.
pub fn transform(
    msg: &InboundMessage,
    rules: &RuleSet,
    media_policy: &SubstitutionPolicy,
) -> Result<TransformResult, ConfigError> {
    let body = msg.body();

    if body.trim().is_empty() && msg.media.is_none() {
        return Ok(TransformResult::Dropped(DropReason::Empty));
    }

    // Step 1: filter rules
    if let Some(rule) = rules.first_match(body) {
        debug!(id = msg.id, rule = %rule.pattern(), "Message matched filter rule");
        return Ok(TransformResult::Dropped(DropReason::FilteredByRule {
            rule: rule.pattern().to_string(),
        }));
    }

    // Step 2: link unmasking, promotional rewrites, trimming
    let (text, entities) = unmask_links(body, &msg.entities, rules.link_policy());
    let (text, entities) = rules
        .rewrites()
        .iter()
        .fold((text, entities), |(text, entities), rule| {
            let edits = rule.edits(&text);
            if edits.is_empty() {
                (text, entities)
            } else {
                debug!(id = msg.id, rule = %rule.pattern(), edits = edits.len(), "Rewrite applied");
                apply_edits(&text, &entities, edits)
            }
        });
    let (text, entities) = trim(&text, &entities);

    if text.is_empty() && msg.media.is_none() {
        return Ok(TransformResult::Dropped(DropReason::EmptyAfterRewrite));
    }

    // Step 3: media substitution
    let media = match &msg.media {
        None => OutboundMedia::None,
        Some(media) => {
            let eligible = media_policy.enabled
                && media.kind.is_image()
                && (media.has_caption() || !media_policy.captioned_only);
            if eligible {
                let asset = media_policy.replacement.clone().ok_or_else(|| {
                    ConfigError::MissingReplacementAsset {
                        path: media_policy.asset_path.clone(),
                    }
                })?;
                debug!(id = msg.id, kind = media.kind.label(), "Substituting media");
                OutboundMedia::Replacement(asset)
            } else {
                OutboundMedia::Original {
                    kind: media.kind.clone(),
                    file_id: media.file_id.clone(),
                }
            }
        }
    };

    Ok(TransformResult::Deliver(Delivery {
        source_id: msg.id,
        text,
        entities,
        media,
    }))
}

/// Neutralise hidden links.
///
/// A link whose display text differs from its target is replaced by the
/// target URL (unless the policy removes links); otherwise only the link
/// formatting is dropped. Entities with invalid spans are discarded.
fn unmask_links(
    text: &str,
    entities: &[MessageEntity],
    policy: LinkPolicy,
) -> (String, Vec<MessageEntity>) {
    let mut edits = Vec::new();
    let mut kept = Vec::with_capacity(entities.len());

    for entity in entities {
        let Some(display) = text.get(entity.offset..entity.end()) else {
            continue;
        };
        match &entity.kind {
            EntityKind::TextLink { url } => {
                if policy == LinkPolicy::Unmask && display.trim() != url.trim() {
                    edits.push(TextEdit::new(entity.offset..entity.end(), url.trim()));
                }
            }
            _ => kept.push(entity.clone()),
        }
    }

    apply_edits(text, &kept, edits)
}

/// Remove leading and trailing whitespace, remapping entities.
fn trim(text: &str, entities: &[MessageEntity]) -> (String, Vec<MessageEntity>) {
    let start = text.len() - text.trim_start().len();
    let end = text.trim_end().len();
    if start == 0 && end == text.len() {
        return (text.to_string(), entities.to_vec());
    }
    let mut edits = vec![TextEdit::new(0..start, "")];
    if end > start {
        edits.push(TextEdit::new(end..text.len(), ""));
    }
    apply_edits(text, entities, edits)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Start,
    End,
}

/// Apply non-overlapping edits and carry entities across them.
///
/// Edits are applied in offset order; an edit overlapping an earlier one is
/// skipped. An entity boundary inside an edited range snaps to the edge of
/// the replacement, so an entity covering a replaced span covers its
/// replacement. Entities reduced to zero length are removed.
pub fn apply_edits(
    text: &str,
    entities: &[MessageEntity],
    mut edits: Vec<TextEdit>,
) -> (String, Vec<MessageEntity>) {
    edits.sort_by_key(|e| (e.range.start, e.range.end));

    let mut out = String::with_capacity(text.len());
    // (old range, new range) for each applied edit
    let mut applied: Vec<(Range<usize>, Range<usize>)> = Vec::with_capacity(edits.len());
    let mut cursor = 0;

    for edit in edits {
        let Range { start, end } = edit.range;
        if start < cursor
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            continue;
        }
        out.push_str(&text[cursor..start]);
        let new_start = out.len();
        out.push_str(&edit.replacement);
        applied.push((start..end, new_start..out.len()));
        cursor = end;
    }
    out.push_str(&text[cursor..]);

    let map = |pos: usize, side: Side| -> usize {
        let mut delta: isize = 0;
        for (old, new) in &applied {
            if pos <= old.start {
                break;
            }
            if pos >= old.end {
                delta = new.end as isize - old.end as isize;
                continue;
            }
            return match side {
                Side::Start => new.start,
                Side::End => new.end,
            };
        }
        (pos as isize + delta) as usize
    };

    let remapped = entities
        .iter()
        .filter_map(|entity| {
            let start = map(entity.offset, Side::Start);
            let end = map(entity.end(), Side::End);
            (end > start).then(|| MessageEntity::new(start, end - start, entity.kind.clone()))
        })
        .collect();

    (out, remapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::rules::RewriteRule;
    use crate::pipeline::types::{Media, MediaKind};

    fn asset() -> ReplacementAsset {
        ReplacementAsset::new("replacement.png", vec![0x89, 0x50, 0x4E, 0x47])
    }

    fn link(offset: usize, length: usize, url: &str) -> MessageEntity {
        MessageEntity::new(offset, length, EntityKind::TextLink { url: url.into() })
    }

    fn bold(offset: usize, length: usize) -> MessageEntity {
        MessageEntity::new(offset, length, EntityKind::Style { name: "bold".into() })
    }

    fn deliver(result: TransformResult) -> Delivery {
        match result {
            TransformResult::Deliver(d) => d,
            other => panic!("Expected Deliver, got {other:?}"),
        }
    }

    fn plain(msg: &InboundMessage) -> Delivery {
        deliver(transform(msg, &RuleSet::empty(), &SubstitutionPolicy::disabled()).unwrap())
    }

    fn substituted(msg: &InboundMessage) -> Delivery {
        deliver(transform(msg, &RuleSet::empty(), &SubstitutionPolicy::captioned(asset())).unwrap())
    }

    fn photo(file_id: &str, caption: &str) -> Media {
        Media::new(MediaKind::Photo, file_id).with_caption(caption)
    }

    #[test]
    fn drops_on_filter_match() {
        let rules = RuleSet::parse(["join our channel"], Vec::<String>::new()).unwrap();
        let msg = InboundMessage::text(1, "Join our channel now!!!");
        let result = transform(&msg, &rules, &SubstitutionPolicy::disabled()).unwrap();
        assert!(matches!(
            result,
            TransformResult::Dropped(DropReason::FilteredByRule { .. })
        ));
    }

    #[test]
    fn filter_checks_caption() {
        let rules = RuleSet::parse(["deposit bonus"], Vec::<String>::new()).unwrap();
        let msg = InboundMessage::media(
            1,
            Media::new(MediaKind::Photo, "f").with_caption("50% DEPOSIT BONUS"),
        );
        let result = transform(&msg, &rules, &SubstitutionPolicy::captioned(asset())).unwrap();
        assert!(matches!(result, TransformResult::Dropped(_)));
    }

    #[test]
    fn filter_match_short_circuits_missing_asset() {
        let rules = RuleSet::parse(["buy"], Vec::<String>::new()).unwrap();
        let policy = SubstitutionPolicy {
            enabled: true,
            captioned_only: true,
            asset_path: "missing.png".into(),
            replacement: None,
        };
        let msg = InboundMessage::media(1, photo("f", "Buy now"));
        assert!(matches!(
            transform(&msg, &rules, &policy).unwrap(),
            TransformResult::Dropped(_)
        ));
    }

    #[test]
    fn passes_through_plain_text() {
        let msg = InboundMessage::text(7, "Hello world");
        let d = plain(&msg);
        assert_eq!(d.source_id, 7);
        assert_eq!(d.text, "Hello world");
        assert!(d.media.is_none());
        assert!(d.entities.is_empty());
    }

    #[test]
    fn drops_empty_message() {
        let msg = InboundMessage::text(1, "  ");
        assert_eq!(
            transform(&msg, &RuleSet::empty(), &SubstitutionPolicy::disabled()).unwrap(),
            TransformResult::Dropped(DropReason::Empty)
        );
    }

    #[test]
    fn unmasks_disguised_link() {
        let msg = InboundMessage::text(1, "Read the docs today")
            .with_entities(vec![link(9, 4, "https://evil.example/x")]);
        let d = plain(&msg);
        assert_eq!(d.text, "Read the https://evil.example/x today");
        assert!(!d.text.contains("docs"));
        assert!(d.entities.is_empty());
    }

    #[test]
    fn identical_link_is_only_unformatted() {
        let msg = InboundMessage::text(1, "see https://a.example")
            .with_entities(vec![link(4, 17, "https://a.example")]);
        let d = plain(&msg);
        assert_eq!(d.text, "see https://a.example");
        assert!(d.entities.is_empty());
    }

    #[test]
    fn remove_policy_keeps_display_text() {
        let rules = RuleSet::empty().with_link_policy(LinkPolicy::Remove);
        let msg = InboundMessage::text(1, "Click here for more")
            .with_entities(vec![link(6, 4, "https://t.me/+invite")]);
        let d = deliver(transform(&msg, &rules, &SubstitutionPolicy::disabled()).unwrap());
        assert_eq!(d.text, "Click here for more");
        assert!(d.entities.is_empty());
    }

    #[test]
    fn formatting_is_remapped_after_unmasking() {
        // "Go here now": bold over "now", link over "here"
        let msg = InboundMessage::text(1, "Go here now")
            .with_entities(vec![link(3, 4, "https://x.io"), bold(8, 3)]);
        let d = plain(&msg);
        assert_eq!(d.text, "Go https://x.io now");
        assert_eq!(d.entities, vec![bold(16, 3)]);
        assert_eq!(&d.text[16..19], "now");
    }

    #[test]
    fn formatting_around_link_covers_url() {
        let msg = InboundMessage::text(1, "Go here")
            .with_entities(vec![bold(3, 4), link(3, 4, "https://x.io")]);
        let d = plain(&msg);
        assert_eq!(d.entities, vec![bold(3, 12)]);
    }

    #[test]
    fn handles_multibyte_text() {
        let text = "مرحبا هنا";
        let start = "مرحبا ".len();
        let msg = InboundMessage::text(1, text)
            .with_entities(vec![link(start, "هنا".len(), "https://x.io")]);
        let d = plain(&msg);
        assert_eq!(d.text, "مرحبا https://x.io");
    }

    #[test]
    fn invalid_entity_span_is_ignored() {
        let msg = InboundMessage::text(1, "short").with_entities(vec![link(2, 40, "https://x.io")]);
        let d = plain(&msg);
        assert_eq!(d.text, "short");
    }

    #[test]
    fn rewrites_strip_promotional_lines() {
        let mut rules = RuleSet::empty();
        rules.add_rewrite(RewriteRule::parse(r"/^.*register here.*$\n?/").unwrap());
        rules.add_rewrite(RewriteRule::parse("@oldhandle->@newhandle").unwrap());
        let msg = InboundMessage::text(1, "Signal EURUSD\nREGISTER HERE now\ncontact @oldhandle");
        let d = deliver(transform(&msg, &rules, &SubstitutionPolicy::disabled()).unwrap());
        assert_eq!(d.text, "Signal EURUSD\ncontact @newhandle");
    }

    #[test]
    fn rewrite_to_empty_text_drops() {
        let mut rules = RuleSet::empty();
        rules.add_rewrite(RewriteRule::parse("promo").unwrap());
        let msg = InboundMessage::text(1, " PROMO ");
        assert_eq!(
            transform(&msg, &rules, &SubstitutionPolicy::disabled()).unwrap(),
            TransformResult::Dropped(DropReason::EmptyAfterRewrite)
        );
    }

    #[test]
    fn trimming_shifts_entities() {
        let msg = InboundMessage::text(1, "  hi there  ").with_entities(vec![bold(5, 5)]);
        let d = plain(&msg);
        assert_eq!(d.text, "hi there");
        assert_eq!(d.entities, vec![bold(3, 5)]);
    }

    #[test]
    fn substitutes_captioned_image() {
        let msg = InboundMessage::media(1, photo("orig", "Buy now"));
        let d = substituted(&msg);
        assert_eq!(d.text, "Buy now");
        assert_eq!(d.media, OutboundMedia::Replacement(asset()));
    }

    #[test]
    fn substituted_caption_is_the_filtered_caption() {
        let msg = InboundMessage::media(
            1,
            Media::new(MediaKind::Photo, "orig").with_caption("Entry 1.0850 here"),
        )
        .with_entities(vec![link(13, 4, "https://x.io")]);
        let d = substituted(&msg);
        assert_eq!(d.text, "Entry 1.0850 https://x.io");
        assert!(matches!(d.media, OutboundMedia::Replacement(_)));
    }

    #[test]
    fn uncaptioned_image_passes_through() {
        let msg = InboundMessage::media(1, Media::new(MediaKind::Photo, "orig"));
        let d = substituted(&msg);
        assert_eq!(
            d.media,
            OutboundMedia::Original {
                kind: MediaKind::Photo,
                file_id: "orig".into()
            }
        );
        assert_eq!(d.text, "");
    }

    #[test]
    fn captioned_only_off_substitutes_everything_image() {
        let mut policy = SubstitutionPolicy::captioned(asset());
        policy.captioned_only = false;
        let msg = InboundMessage::media(1, Media::new(MediaKind::Photo, "orig"));
        let d = deliver(transform(&msg, &RuleSet::empty(), &policy).unwrap());
        assert!(matches!(d.media, OutboundMedia::Replacement(_)));
    }

    #[test]
    fn non_image_media_passes_through() {
        let msg =
            InboundMessage::media(1, Media::new(MediaKind::Video, "vid").with_caption("clip"));
        let d = substituted(&msg);
        assert!(matches!(d.media, OutboundMedia::Original { .. }));
    }

    #[test]
    fn disabled_substitution_passes_through() {
        let msg = InboundMessage::media(1, photo("orig", "Buy now"));
        let d = plain(&msg);
        assert!(matches!(d.media, OutboundMedia::Original { .. }));
    }

    #[test]
    fn missing_asset_is_config_error() {
        let policy = SubstitutionPolicy {
            enabled: true,
            captioned_only: true,
            asset_path: "replacement_image.png".into(),
            replacement: None,
        };
        let msg = InboundMessage::media(1, photo("orig", "Buy now"));
        let err = transform(&msg, &RuleSet::empty(), &policy).unwrap_err();
        assert!(matches!(err, ConfigError::MissingReplacementAsset { .. }));
    }

    #[test]
    fn apply_edits_skips_overlaps() {
        let (out, _) = apply_edits(
            "abcdef",
            &[],
            vec![TextEdit::new(1..4, "X"), TextEdit::new(2..5, "Y")],
        );
        assert_eq!(out, "aXef");
    }

    #[test]
    fn apply_edits_drops_collapsed_entities() {
        let (out, entities) =
            apply_edits("abc promo def", &[bold(4, 5)], vec![TextEdit::new(4..9, "")]);
        assert_eq!(out, "abc  def");
        assert!(entities.is_empty());
    }
}
