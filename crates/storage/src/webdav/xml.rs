//! PROPFIND multistatus parsing.
//!
//! Element matching ignores namespace prefixes (`D:response`, `d:response`,
//! and unprefixed `response` are all common in the wild).

use chrono::{DateTime, Utc};
use models::Error;
use quick_xml::events::Event;
use quick_xml::Reader;

/// One resource extracted from a `<multistatus>` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DavResource {
    pub href: String,
    pub display_name: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub is_collection: bool,
}

impl DavResource {
    /// The percent-decoded path component of `href`.
    pub fn decoded_path(&self) -> String {
        let path = self
            .href
            .strip_prefix("http://")
            .or_else(|| self.href.strip_prefix("https://"))
            .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or(&self.href);
        percent_encoding::percent_decode_str(path).decode_utf8_lossy().into_owned()
    }

    /// Resource name: displayname when present, else the last href segment.
    pub fn name(&self) -> String {
        if let Some(name) = &self.display_name {
            if !name.is_empty() {
                return name.clone();
            }
        }
        let path = self.decoded_path();
        path.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string()
    }
}

pub fn parse_multistatus(xml: &[u8]) -> Result<Vec<DavResource>, Error> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut element: Vec<u8> = Vec::new();
    let mut in_resource_type = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let local = start.local_name().as_ref().to_ascii_lowercase();
                match local.as_slice() {
                    b"response" => current = Some(DavResource::default()),
                    b"resourcetype" => in_resource_type = true,
                    b"collection" => {
                        if in_resource_type {
                            if let Some(cur) = current.as_mut() {
                                cur.is_collection = true;
                            }
                        }
                    }
                    _ => {}
                }
                element = local;
            }
            Ok(Event::Empty(empty)) => {
                let local = empty.local_name().as_ref().to_ascii_lowercase();
                if local == b"collection" && in_resource_type {
                    if let Some(cur) = current.as_mut() {
                        cur.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(text)) => {
                let Some(cur) = current.as_mut() else {
                    buf.clear();
                    continue;
                };
                let value = text.unescape().map_err(Error::internal)?.into_owned();
                match element.as_slice() {
                    b"href" => cur.href = value,
                    b"displayname" => cur.display_name = Some(value),
                    b"getcontentlength" => cur.content_length = value.parse().ok(),
                    b"getlastmodified" => {
                        cur.last_modified = DateTime::parse_from_rfc2822(&value)
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc));
                    }
                    b"getcontenttype" => cur.content_type = Some(value),
                    b"getetag" => cur.etag = Some(value.trim_matches('"').to_string()),
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                let local = end.local_name().as_ref().to_ascii_lowercase();
                match local.as_slice() {
                    b"response" => {
                        if let Some(done) = current.take() {
                            resources.push(done);
                        }
                    }
                    b"resourcetype" => in_resource_type = false,
                    _ => {}
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(Error::upstream(0, None, format!("invalid multistatus XML: {err}")))
            }
        }
        buf.clear();
    }
    Ok(resources)
}
