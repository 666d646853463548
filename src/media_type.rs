use mime::Mime;
use url::Url;

use crate::tracker::DownloadKind;

/// Coarse classification of a resolved MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeClass {
    Feed,
    Audio,
    Image,
    /// Generic types servers use for anything (`application/octet-stream`, `text/plain`)
    Ambiguous,
    Unknown,
}

/// Classify a MIME type string, parameters included
///
/// A missing type is ambiguous, one that does not parse is unknown.
pub fn classify(content_type: &str) -> MimeClass {
    let content_type = content_type.trim();
    if content_type.is_empty() {
        return MimeClass::Ambiguous;
    }
    match content_type.parse::<Mime>() {
        Ok(mime) => classify_mime(&mime),
        Err(_) => MimeClass::Unknown,
    }
}

fn classify_mime(mime: &Mime) -> MimeClass {
    let (type_, subtype) = (mime.type_(), mime.subtype());

    if type_ == mime::AUDIO {
        MimeClass::Audio
    } else if type_ == mime::IMAGE {
        MimeClass::Image
    } else if subtype == mime::XML || mime.suffix() == Some(mime::XML) {
        // text/xml, application/xml, application/rss+xml, application/atom+xml
        MimeClass::Feed
    } else if subtype == mime::OCTET_STREAM || (type_ == mime::TEXT && subtype == mime::PLAIN) {
        MimeClass::Ambiguous
    } else {
        MimeClass::Unknown
    }
}

/// Guess a MIME type from the file extension of a location
pub fn guess_from_location(location: &str) -> Option<Mime> {
    match Url::parse(location) {
        Ok(url) => mime_guess::from_path(url.path()).first(),
        Err(_) => mime_guess::from_path(location).first(),
    }
}

/// Decide how a completed download is handled
///
/// The MIME type picks the handler; the kind recorded at request time breaks
/// ties for generic MIME types. A MIME type contradicting the requested kind
/// is discarded, as is anything unrecognized.
pub fn resolve_kind(requested: DownloadKind, mime: Option<&str>) -> Option<DownloadKind> {
    let class = mime.map(classify).unwrap_or(MimeClass::Ambiguous);
    let resolved = match class {
        MimeClass::Feed => DownloadKind::Feed,
        MimeClass::Audio => DownloadKind::Audio,
        MimeClass::Image => DownloadKind::Image,
        MimeClass::Ambiguous => return Some(requested),
        MimeClass::Unknown => return None,
    };

    (resolved == requested).then_some(resolved)
}
