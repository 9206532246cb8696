//! Rewrites placeholder tokens that the origin embeds in response bodies.
//!
//! Two passes exist and their order matters: [`Rewriter::link_content_to_cache`]
//! turns `CONTENT_URL?serverurl=<path>` tokens into direct links to cached
//! files, then [`Rewriter::replace_all`] replaces whatever placeholders remain.
use crate::proxy::InboundRequest;
use derive_builder::Builder;
use shelter_cache::{BodyRef, Cache, CacheEntry, TypeSelector};
use shelter_http::HttpResponse;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CONTENT_URL_PLACEHOLDER: &str = "%%shelter_content_url%%";
pub const ACTION_URL_PLACEHOLDER: &str = "%%shelter_action_url%%";
pub const SITE_URL_PLACEHOLDER: &str = "%%site_url%%";
pub const PAGE_ID_PLACEHOLDER: &str = "%%site_page_id%%";
pub const PAGE_URL_PLACEHOLDER: &str = "%%site_page_url%%";
/// `%%site_option_<NAME>%%` is replaced by the stored option `<NAME>`.
pub const OPTION_PLACEHOLDER_PREFIX: &str = "%%site_option_";

const PLACEHOLDER_END: &str = "%%";
const SERVER_URL_PARAM: &str = "serverurl";

#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct RewriterOptions {
    /// Local endpoint serving proxied content.
    #[builder(default = "\"/shelter/content\".to_string()")]
    pub content_endpoint: String,
    /// Url under which cached body files are served.
    #[builder(default = "\"/cachedata\".to_string()")]
    pub public_base_url: String,
    #[builder(default = "\"http://localhost\".to_string()")]
    pub site_url: String,
    #[builder(default = "None")]
    pub page_id: Option<String>,
    #[builder(default = "None")]
    pub page_url: Option<String>,
}

pub struct Rewriter {
    cache: Arc<Cache>,
    options: RewriterOptions,
}

impl Rewriter {
    pub fn new(cache: Arc<Cache>, options: RewriterOptions) -> Self {
        Self { cache, options }
    }

    pub fn options(&self) -> &RewriterOptions {
        &self.options
    }

    /// Point `CONTENT_URL?serverurl=<path>` tokens straight at cached files.
    ///
    /// Only fresh, file-backed entries that are untagged or tagged `content`
    /// are candidates. Returns how many tokens were linked.
    pub async fn link_content_to_cache(&self, response: &mut HttpResponse) -> usize {
        let token = format!("{CONTENT_URL_PLACEHOLDER}?{SERVER_URL_PARAM}=");
        let Some(text) = response.body_text() else {
            return 0;
        };
        if !text.contains(&token) {
            return 0;
        }

        let mut entries = self
            .cache
            .entries_by_type(&TypeSelector::Tagged("content".to_string()), true)
            .await;
        entries.extend(self.cache.entries_by_type(&TypeSelector::Untagged, true).await);

        let (linked, count) = link_to_cached_files(text, &entries, &self.options.public_base_url);
        if count > 0 {
            debug!(count, "linked content placeholders to cached files");
            response.set_body(linked);
        }
        count
    }

    /// Replace the remaining placeholders in `text/*` responses.
    ///
    /// The action url is `action_url` when given, otherwise the inbound
    /// request url without its `serverurl` parameter.
    pub async fn replace_all(
        &self,
        response: &mut HttpResponse,
        action_url: Option<&str>,
        inbound: &InboundRequest,
    ) {
        if !response.is_text() {
            return;
        }
        let Some(text) = response.body_text() else {
            return;
        };

        let mut text = replace_url_placeholder(
            text,
            CONTENT_URL_PLACEHOLDER,
            &self.options.content_endpoint,
        );

        let current = inbound
            .url
            .as_deref()
            .map(|url| strip_query_param(url, SERVER_URL_PARAM));
        if let Some(action) = action_url.map(str::to_string).or(current) {
            text = replace_url_placeholder(&text, ACTION_URL_PLACEHOLDER, &action);
        }
        if let Some(page_url) = &self.options.page_url {
            text = replace_url_placeholder(&text, PAGE_URL_PLACEHOLDER, page_url);
        }

        text = text.replace(SITE_URL_PLACEHOLDER, &self.options.site_url);
        text = text.replace(
            PAGE_ID_PLACEHOLDER,
            self.options.page_id.as_deref().unwrap_or_default(),
        );
        text = self.replace_option_placeholders(&text).await;

        response.set_body(text);
    }

    async fn replace_option_placeholders(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut values: HashMap<String, String> = HashMap::new();
        let mut rest = text;

        while let Some(start) = rest.find(OPTION_PLACEHOLDER_PREFIX) {
            let name_start = start + OPTION_PLACEHOLDER_PREFIX.len();
            let Some(name_len) = rest[name_start..].find(PLACEHOLDER_END) else {
                break;
            };
            let name = &rest[name_start..name_start + name_len];

            if !values.contains_key(name) {
                let value = match self.cache.store().get_option(name).await {
                    Ok(value) => value.unwrap_or_default(),
                    Err(e) => {
                        warn!(option = name, error = %e, "option lookup failed");
                        String::new()
                    }
                };
                values.insert(name.to_string(), escape_html(&value));
            }

            out.push_str(&rest[..start]);
            out.push_str(values.get(name).map(String::as_str).unwrap_or_default());
            rest = &rest[name_start + name_len + PLACEHOLDER_END.len()..];
        }

        out.push_str(rest);
        out
    }
}

/// Replace `placeholder` with `target`. When `target` carries its own query
/// string, `placeholder?` becomes `target&` first so query strings merge.
pub fn replace_url_placeholder(content: &str, placeholder: &str, target: &str) -> String {
    if target.contains('?') {
        content
            .replace(&format!("{placeholder}?"), &format!("{target}&"))
            .replace(placeholder, target)
    } else {
        content.replace(placeholder, target)
    }
}

/// Rewrite every `CONTENT_URL?serverurl=<url>` token whose url (raw or
/// url-encoded, case-insensitive) is the url of a file-backed entry. The
/// longest matching url wins. Returns the new text and the number of
/// replacements.
pub fn link_to_cached_files(
    content: &str,
    entries: &[CacheEntry],
    public_base_url: &str,
) -> (String, usize) {
    let token = format!("{CONTENT_URL_PLACEHOLDER}?{SERVER_URL_PARAM}=");

    let mut candidates: Vec<(String, &str)> = Vec::new();
    for entry in entries {
        let BodyRef::File(filename) = &entry.body else {
            continue;
        };
        let raw = entry.url.to_lowercase();
        let encoded: String = url::form_urlencoded::byte_serialize(raw.as_bytes())
            .collect::<String>()
            .to_lowercase();
        if encoded != raw {
            candidates.push((encoded, filename));
        }
        candidates.push((raw, filename));
    }
    candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    if candidates.is_empty() {
        return (content.to_string(), 0);
    }

    let base = public_base_url.trim_end_matches('/');
    let mut out = content.to_string();
    let mut count = 0;
    let mut cursor = 0;

    while let Some(found) = out[cursor..].find(&token) {
        let at = cursor + found;
        let after = &out.as_bytes()[at + token.len()..];
        let matched = candidates.iter().find(|(url, _)| {
            after.len() >= url.len() && after[..url.len()].eq_ignore_ascii_case(url.as_bytes())
        });

        match matched {
            Some((url, filename)) => {
                let replacement = format!("{base}/{filename}");
                let end = at + token.len() + url.len();
                out.replace_range(at..end, &replacement);
                cursor = at + replacement.len();
                count += 1;
            }
            None => cursor = at + token.len(),
        }
    }

    (out, count)
}

/// Drop every `name` parameter from the query string of `url`.
pub fn strip_query_param(url: &str, name: &str) -> String {
    let (without_fragment, fragment) = match url.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (url, None),
    };
    let Some((base, query)) = without_fragment.split_once('?') else {
        return url.to_string();
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let mut kept = 0;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if !key.eq_ignore_ascii_case(name) {
            serializer.append_pair(&key, &value);
            kept += 1;
        }
    }

    let mut result = base.to_string();
    if kept > 0 {
        result.push('?');
        result.push_str(&serializer.finish());
    }
    if let Some(fragment) = fragment {
        result.push('#');
        result.push_str(fragment);
    }
    result
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            c => out.push(c),
        }
    }
    out
}
