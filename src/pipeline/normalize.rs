use anyhow::{Context, Result};
use regex::Regex;

use crate::config::NormalizeConfig;

/// Canonical label put in front of every rewritten drive-share line.
pub const SHARE_LABEL: &str = "网盘资源链接：";

// Optional leading pictograph (symbols, emoji) shared by both line patterns.
const GLYPH: &str = r"(?:[\x{1F300}-\x{1FAFF}\x{2600}-\x{27BF}]\s*)?";

/// Line-oriented cleanup applied to forwarded text after templating.
#[derive(Debug, Clone)]
pub struct Normalizer {
    attribution: Regex,
    share_url: Regex,
    share_label: Regex,
    replacement_host: String,
    suffix_note: String,
}

impl Normalizer {
    pub fn new(config: &NormalizeConfig) -> Result<Self> {
        Ok(Self {
            attribution: Regex::new(&format!(r"^\s*{}(?:来自|频道|群组|投稿)\s*[:：]", GLYPH))
                .context("Invalid attribution pattern")?,
            share_url: Regex::new(r"(?i)https?://pan\.quark\.cn/s/[A-Za-z0-9]+")
                .context("Invalid share url pattern")?,
            share_label: Regex::new(&format!(
                r"^\s*{}(?:夸克|链接|网盘资源链接)\s*[:：]?\s*",
                GLYPH
            ))
            .context("Invalid share label pattern")?,
            replacement_host: config.replacement_host.clone(),
            suffix_note: config.suffix_note.clone(),
        })
    }

    /// 1. Drop the first attribution line ("来自：…", "📢 频道：…") and
    ///    everything below it.
    /// 2. Rewrite drive-share lines: URL → replacement host, label → canonical,
    ///    suffix note appended once.
    /// 3. Trim trailing blank lines and surrounding whitespace.
    pub fn normalize(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let unified = text.replace("\r\n", "\n").replace('\r', "\n");
        let mut out: Vec<String> = Vec::new();

        for line in unified.split('\n') {
            if self.attribution.is_match(line) {
                break;
            }
            if self.share_url.is_match(line) {
                out.push(self.rewrite_share_line(line));
            } else {
                out.push(line.to_string());
            }
        }

        while out.last().is_some_and(|l| l.trim().is_empty()) {
            out.pop();
        }

        out.join("\n").trim().to_string()
    }

    fn rewrite_share_line(&self, line: &str) -> String {
        let replaced = self
            .share_url
            .replace_all(line, regex::NoExpand(&self.replacement_host))
            .into_owned();

        let mut labeled = if self.share_label.is_match(&replaced) {
            self.share_label
                .replace(&replaced, regex::NoExpand(SHARE_LABEL))
                .into_owned()
        } else {
            format!("{}{}", SHARE_LABEL, replaced.trim_start())
        };
        labeled = labeled.trim_end().to_string();

        if !self.suffix_note.is_empty()
            && labeled.contains(&self.replacement_host)
            && !labeled.contains(&self.suffix_note)
        {
            labeled = format!("{} {}", labeled, self.suffix_note);
        }
        labeled
    }
}
