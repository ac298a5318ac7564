//! # Media Extractor
//!
//! Pulls media references out of a document's HTML: `img`, `video`, `audio`
//! and `source` elements, plus `a` links pointing at media file extensions.
//! Each reference becomes an [`Occurrence`] on a deduplicated [`MediaAsset`].

use crate::media::{occurrence_id, MediaAsset, MediaIndex, MediaType, Occurrence};
use crate::{Result, ScanError};
use regex::Regex;
use std::collections::HashMap;
use url::Url;

/// Characters of preceding page text kept as occurrence context
const CONTEXT_CHARS: usize = 100;

const IGNORED_SCHEMES: &[&str] = &["data:", "javascript:", "mailto:", "tel:", "blob:"];

pub struct MediaExtractor {
    element_re: Regex,
    attribute_re: Regex,
    tag_re: Regex,
    internal_domains: Vec<String>,
}

impl MediaExtractor {
    pub fn new(internal_domains: Vec<String>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| ScanError::Config(format!("Invalid extractor pattern: {}", e)))
        };

        Ok(Self {
            element_re: compile(r"(?i)<(img|video|audio|source|a)\b([^>]*)>")?,
            attribute_re: compile(
                r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#,
            )?,
            tag_re: compile(r"<[^>]*>")?,
            internal_domains: internal_domains
                .into_iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        })
    }

    /// Extract every media asset referenced by `page`
    ///
    /// Repeated references to one `src` yield one asset with one occurrence
    /// per reference.
    pub fn extract(&self, page: &str, html: &str) -> Vec<MediaAsset> {
        let mut index = MediaIndex::new();
        let mut per_src: HashMap<String, usize> = HashMap::new();
        let mut text = String::new();
        let mut last_end = 0;

        for caps in self.element_re.captures_iter(html) {
            let Some(whole) = caps.get(0) else { continue };
            self.append_text(&mut text, &html[last_end..whole.start()]);
            last_end = whole.end();

            let tag = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
            let attributes = self.attributes(caps.get(2).map(|m| m.as_str()).unwrap_or(""));

            let link_attr = if tag == "a" { "href" } else { "src" };
            let Some(src) = attributes.get(link_attr).map(|s| decode_entities(s.trim())) else {
                continue;
            };
            if src.is_empty() || src.starts_with('#') || has_ignored_scheme(&src) {
                continue;
            }

            let media_type = match (tag.as_str(), MediaType::from_src(&src)) {
                (_, Some(media_type)) => media_type,
                ("img", None) => MediaType::Image,
                ("video" | "audio" | "source", None) => MediaType::Video,
                _ => continue,
            };

            let alt = attributes.get("alt").map(|a| a.trim()).filter(|a| !a.is_empty());
            let title = attributes.get("title").map(|t| t.trim()).filter(|t| !t.is_empty());

            let position = per_src.entry(src.clone()).or_insert(0);
            let occurrence = Occurrence {
                id: occurrence_id(page, &src, *position),
                page: page.to_string(),
                has_alt_text: alt.is_some(),
                has_title: title.is_some(),
                context: tail_chars(text.trim(), CONTEXT_CHARS),
            };
            *position += 1;

            let mut asset = MediaAsset::new(src.as_str(), media_type, self.is_external(&src));
            asset.alt = alt.map(str::to_string);
            asset.add_occurrence(occurrence);
            index.upsert(asset);
        }

        index.into_assets()
    }

    /// Whether `src` points outside the internal domains; relative URLs are internal
    pub fn is_external(&self, src: &str) -> bool {
        let parsed = if src.starts_with("//") {
            Url::parse(&format!("https:{}", src))
        } else {
            Url::parse(src)
        };

        let Ok(url) = parsed else {
            return false;
        };
        let Some(host) = url.host_str().map(str::to_lowercase) else {
            return false;
        };

        !self
            .internal_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
    }

    fn attributes(&self, raw: &str) -> HashMap<String, String> {
        self.attribute_re
            .captures_iter(raw)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str().to_lowercase();
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                Some((name, value))
            })
            .collect()
    }

    fn append_text(&self, buffer: &mut String, segment: &str) {
        let stripped = self.tag_re.replace_all(segment, " ");
        for word in stripped.split_whitespace() {
            if !buffer.is_empty() {
                buffer.push(' ');
            }
            buffer.push_str(word);
        }
        if buffer.chars().count() > CONTEXT_CHARS * 2 {
            *buffer = tail_chars(buffer, CONTEXT_CHARS);
        }
    }
}

fn has_ignored_scheme(src: &str) -> bool {
    let lower = src.to_lowercase();
    IGNORED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme))
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(n)).collect()
}
