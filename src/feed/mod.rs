mod location;
mod parse;

pub use location::validate_feed_url;
pub use parse::{FeedParser, RssFeedParser, parse_duration, parse_feed};
