//! Word frequencies collected from discovered names and URLs.
//!
//! Persisted as `<count>\t<word>` lines, most frequent first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;
use url::Url;

use crate::event::{Event, EventKind, host_of, normalized_host};

/// File name inside the scan home.
pub const WORDCLOUD_FILE: &str = "wordcloud.tsv";

const MIN_WORD_LEN: usize = 2;

#[derive(Debug, Default)]
pub struct WordCloud {
    words: Mutex<HashMap<String, u64>>,
}

impl WordCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts the words of `DNS_NAME` and `URL` events; other kinds are
    /// ignored.
    pub fn absorb(&self, event: &Event) {
        let Some(raw) = event.data_str() else {
            return;
        };
        let text = match event.kind() {
            EventKind::DnsName => host_of(raw).unwrap_or_default(),
            EventKind::Url => url_words_source(raw),
            _ => return,
        };
        self.add_text(&text);
    }

    /// Adds every word of `text`.
    pub fn add_text(&self, text: &str) {
        let mut words = self.lock();
        for word in split_words(text) {
            *words.entry(word).or_insert(0) += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count(&self, word: &str) -> u64 {
        self.lock().get(word).copied().unwrap_or(0)
    }

    /// Words sorted by descending count, then alphabetically.
    pub fn ranked(&self) -> Vec<(String, u64)> {
        let mut ranked: Vec<_> = self
            .lock()
            .iter()
            .map(|(w, c)| (w.clone(), *c))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    /// Merges counts from a previously saved file.
    ///
    /// Malformed lines are skipped. Returns the number of words read.
    pub fn load(&self, path: &Path) -> std::io::Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let mut words = self.lock();
        let mut read = 0;
        for line in content.lines() {
            let Some((count, word)) = line.split_once('\t') else {
                continue;
            };
            let (Ok(count), word) = (count.trim().parse::<u64>(), word.trim()) else {
                continue;
            };
            if word.is_empty() {
                continue;
            }
            *words.entry(word.to_owned()).or_insert(0) += count;
            read += 1;
        }
        debug!(path = %path.display(), words = read, "loaded word cloud");
        Ok(read)
    }

    /// Writes the cloud into `dir`, returning the file path.
    pub fn save(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(WORDCLOUD_FILE);
        let mut out = String::new();
        for (word, count) in self.ranked() {
            out.push_str(&format!("{count}\t{word}\n"));
        }
        std::fs::write(&path, out)?;
        Ok(path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        // Counts stay usable even if a holder panicked mid-update.
        self.words.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Host plus path of a URL, without scheme, userinfo, port, query or
/// fragment.
fn url_words_source(raw: &str) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return host_of(raw).unwrap_or_default();
    };
    let host = normalized_host(&url).unwrap_or_default();
    let path = url
        .path_segments()
        .map(|segments| segments.collect::<Vec<_>>().join("/"))
        .unwrap_or_default();
    format!("{host}/{path}")
}

fn split_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() >= MIN_WORD_LEN && !w.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_ascii_lowercase)
}
