//! Synthetic crawl pages endpoint served by wiremock.
//!
//! Chunk `i` at size `s` answers with a header row followed by rows
//! `i*s .. min((i+1)*s, total)`. The probe (`output=json`) answers with the
//! pagination envelope. Chunk requests can be scripted to fail by position.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flate2::Compression;
use flate2::write::GzEncoder;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const CRAWL_ID: u64 = 4242;
pub const PAGES_PATH: &str = "/2.0/crawls/4242/pages";

#[derive(Clone)]
pub struct CrawlApi {
    total: u64,
    /// Status for the n-th chunk request; 200 or out of range serves the chunk.
    script: Arc<Vec<u16>>,
    chunk_requests: Arc<AtomicUsize>,
    gzip: bool,
}

impl CrawlApi {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            script: Arc::new(Vec::new()),
            chunk_requests: Arc::new(AtomicUsize::new(0)),
            gzip: false,
        }
    }

    pub fn with_script(mut self, script: Vec<u16>) -> Self {
        self.script = Arc::new(script);
        self
    }

    pub fn gzipped(mut self) -> Self {
        self.gzip = true;
        self
    }

    pub fn chunk_requests(&self) -> usize {
        self.chunk_requests.load(Ordering::SeqCst)
    }

    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(PAGES_PATH))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    fn body(&self, index: u64, size: u64, deep: &str) -> String {
        let mut body = String::from("url\tstatus\tdeep\n");
        let end = ((index + 1) * size).min(self.total);
        for row in (index * size)..end {
            body.push_str(&format!("https://site.example/{row}\t200\t{deep}\n"));
        }
        body
    }
}

impl Respond for CrawlApi {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let params: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let param = |key: &str| params.get(key).cloned().unwrap_or_default();

        if param("output") == "json" {
            return ResponseTemplate::new(200).set_body_string(format!(
                r#"{{"chunk":{{"total":{},"page":0,"size":1}},"pages":[]}}"#,
                self.total
            ));
        }

        let n = self.chunk_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(&status) = self.script.get(n) {
            if status != 200 {
                return ResponseTemplate::new(status);
            }
        }

        let index: u64 = param("chunk").parse().unwrap_or(0);
        let size: u64 = param("chunk_size").parse().unwrap_or(1);
        let body = self.body(index, size, &param("deep"));
        if self.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body.as_bytes()).unwrap();
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .set_body_bytes(encoder.finish().unwrap())
        } else {
            ResponseTemplate::new(200).set_body_string(body)
        }
    }
}

/// File contents of a complete export.
pub fn expected_export(total: u64, deep: &str) -> String {
    let mut text = String::from("url\tstatus\tdeep\n");
    for row in 0..total {
        text.push_str(&format!("https://site.example/{row}\t200\t{deep}\n"));
    }
    text
}
