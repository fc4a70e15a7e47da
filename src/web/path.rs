// Request path normalization

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SLASH_RUN: Regex = Regex::new(r"/{2,}").expect("valid slash pattern");
}

/// Replace every run of consecutive `/` with a single `/`.
pub fn collapse(path: &str) -> String {
    SLASH_RUN.replace_all(path, "/").into_owned()
}
