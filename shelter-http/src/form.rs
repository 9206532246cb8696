//! Request body encoding for POSTs forwarded to the origin.
//!
//! Nested values are flattened into composite keys before encoding: an
//! all-digit sub key becomes `key[index]`, any other sub key becomes
//! `key.sub`. The origin binds form fields by these names, so the rule is
//! applied identically for url-encoded and multipart bodies, e.g.
//! `Prices[0].Region[1]=150`.
use url::form_urlencoded;

pub const MULTIPART_BOUNDARY: &str =
    "----ShelterBoundary2a84c2ab17e842b590ca5a0e43e756fa";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// A posted form value: plain text or an ordered group of keyed sub values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    Group(Vec<(String, FormValue)>),
}

impl From<&str> for FormValue {
    fn from(value: &str) -> Self {
        FormValue::Text(value.to_string())
    }
}

impl From<String> for FormValue {
    fn from(value: String) -> Self {
        FormValue::Text(value)
    }
}

impl<K: Into<String>> From<Vec<(K, FormValue)>> for FormValue {
    fn from(values: Vec<(K, FormValue)>) -> Self {
        FormValue::Group(values.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

pub type FormFields = Vec<(String, FormValue)>;

/// An uploaded file forwarded as a multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFile {
    /// Parts without a filename are skipped, matching browsers that send an
    /// empty file input.
    pub filename: Option<String>,
    pub content_type: String,
    pub content: Vec<u8>,
}

pub type PostFiles = Vec<(String, PostFile)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Flatten one field into `(composite key, text)` pairs in document order.
pub fn flatten(key: &str, value: &FormValue) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(key, value, &mut out);
    out
}

fn flatten_into(key: &str, value: &FormValue, out: &mut Vec<(String, String)>) {
    match value {
        FormValue::Text(text) => out.push((key.to_string(), text.clone())),
        FormValue::Group(values) => {
            for (sub_key, sub_value) in values {
                let composite = if is_index_key(sub_key) {
                    format!("{key}[{sub_key}]")
                } else {
                    format!("{key}.{sub_key}")
                };
                flatten_into(&composite, sub_value, out);
            }
        }
    }
}

fn is_index_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

fn field_name(key: &str, underscore_to_period: bool) -> String {
    if underscore_to_period {
        key.replace('_', ".")
    } else {
        key.to_string()
    }
}

/// Encode fields as `application/x-www-form-urlencoded`.
pub fn encode_urlencoded(fields: &FormFields, underscore_to_period: bool) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in fields {
        let key = field_name(key, underscore_to_period);
        for (name, text) in flatten(&key, value) {
            serializer.append_pair(&name, &text);
        }
    }
    serializer.finish()
}

/// Encode fields and files as `multipart/form-data` using
/// [`MULTIPART_BOUNDARY`].
pub fn encode_multipart(
    fields: &FormFields,
    files: &PostFiles,
    underscore_to_period: bool,
) -> Vec<u8> {
    let mut body = Vec::new();

    for (key, value) in fields {
        let key = field_name(key, underscore_to_period);
        for (name, text) in flatten(&key, value) {
            body.extend_from_slice(
                format!(
                    "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(text.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
    }

    for (key, file) in files {
        let Some(filename) = file.filename.as_deref() else {
            continue;
        };
        let key = field_name(key, underscore_to_period);
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{key}\"; filename=\"{filename}\"\r\nContent-Type: {}\r\n\r\n",
                file.content_type
            )
            .as_bytes(),
        );
        body.extend_from_slice(&file.content);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

/// Pick the encoding for a POST body: multipart when files are present,
/// url-encoded otherwise.
pub fn encode_body(
    fields: &FormFields,
    files: &PostFiles,
    underscore_to_period: bool,
) -> EncodedBody {
    if files.is_empty() {
        EncodedBody {
            content_type: FORM_URLENCODED.to_string(),
            bytes: encode_urlencoded(fields, underscore_to_period).into_bytes(),
        }
    } else {
        EncodedBody {
            content_type: format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
            bytes: encode_multipart(fields, files, underscore_to_period),
        }
    }
}
