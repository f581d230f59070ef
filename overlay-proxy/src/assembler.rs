//! Byte-range responses out of piece-split bags: fetch the covering pieces with a small worker pool,
//! emit them strictly in ascending order, trimmed to the requested window.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use overlay_core::mime::content_type_for;
use overlay_core::piece::worker_count;
use overlay_core::range::parse_range_header;
use overlay_core::{ByteRange, Header, PieceWindow};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::message::GatewayResponse;
use crate::storage::{Downloader, StorageError};
use crate::stream::{DataStream, StreamWriter, DEFAULT_STREAM_BUFFER};

/// Served when the request path is empty.
pub const INDEX_FILE: &str = "index.html";

pub struct OrderedPieceAssembler {
    stream_buffer: usize,
}

impl Default for OrderedPieceAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER)
    }
}

impl OrderedPieceAssembler {
    pub fn new(stream_buffer: usize) -> Self {
        Self { stream_buffer }
    }

    /// Answer `path` of the bag, honouring a single-range `Range` header.
    /// The body streams from a background task tied to `cancel`.
    pub async fn serve(
        &self,
        downloader: Arc<dyn Downloader>,
        path: &str,
        range_header: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        self.serve_holding(downloader, path, range_header, cancel, ())
            .await
    }

    /// Like `serve`, keeping `hold` alive until the body has been fully produced or aborted.
    pub async fn serve_holding<H: Send + 'static>(
        &self,
        downloader: Arc<dyn Downloader>,
        path: &str,
        range_header: Option<&str>,
        cancel: &CancellationToken,
        hold: H,
    ) -> Result<GatewayResponse, GatewayError> {
        let path = bag_path(path);
        let Some(span) = downloader.file_offsets(path) else {
            debug!(path, "file not in bag");
            return Ok(GatewayResponse::with_body(404, vec![], &[]));
        };

        let (status, range) = match range_header {
            Some(value) => (206, Some(parse_range_header(value, span.size)?)),
            None => (200, ByteRange::full(span.size)),
        };

        let mut headers = vec![
            Header::new("Content-Type", content_type_for(path)),
            Header::new("Accept-Ranges", "bytes"),
        ];
        let Some(range) = range else {
            // Empty file, no range asked.
            return Ok(GatewayResponse::with_body(200, headers, &[]));
        };
        if status == 206 {
            headers.push(Header::new("Content-Range", range.content_range(span.size)));
        }

        let window = PieceWindow::new(&span, downloader.piece_size(), range);
        debug!(
            path,
            from = range.from,
            to = range.to,
            first_piece = window.first,
            last_piece = window.last,
            "serving from bag"
        );
        let (writer, body) = DataStream::new(self.stream_buffer);
        let cancel_child = cancel.child_token();
        tokio::spawn(async move {
            assemble(downloader, window, writer, cancel_child).await;
            drop(hold);
        });

        Ok(GatewayResponse {
            status,
            reason: String::new(),
            headers,
            content_length: Some(range.len()),
            body,
            trailers: Default::default(),
        })
    }
}

/// Bag-relative file path: leading slash dropped, empty means the index file.
pub fn bag_path(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    match path.trim_start_matches('/') {
        "" => INDEX_FILE,
        p => p,
    }
}

type PieceResult = (u32, Result<Bytes, StorageError>);

async fn assemble(
    downloader: Arc<dyn Downloader>,
    window: PieceWindow,
    writer: StreamWriter,
    stop: CancellationToken,
) {
    // Workers stop when assembly ends, whichever way it ends.
    let _stop_workers = stop.clone().drop_guard();
    let workers = worker_count(window.piece_count());
    let (job_tx, job_rx) = mpsc::unbounded_channel::<u32>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<PieceResult>(workers);
    for _ in 0..workers {
        tokio::spawn(fetch_worker(
            downloader.clone(),
            job_rx.clone(),
            result_tx.clone(),
            stop.clone(),
        ));
    }
    drop(result_tx);

    // At most `workers` pieces are queued, in flight, or cached at any time.
    let last = window.last as u64;
    let mut next_job = window.first as u64;
    let enqueue = |next_job: &mut u64| {
        if *next_job <= last {
            let _ = job_tx.send(*next_job as u32);
            *next_job += 1;
        }
    };
    for _ in 0..workers {
        enqueue(&mut next_job);
    }

    let mut early: HashMap<u32, Bytes> = HashMap::new();
    for index in window.indices() {
        let piece = loop {
            if let Some(piece) = early.remove(&index) {
                break piece;
            }
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                r = result_rx.recv() => r,
            };
            match received {
                Some((i, Ok(data))) if i == index => break data,
                Some((i, Ok(data))) => {
                    early.insert(i, data);
                }
                Some((i, Err(e))) => {
                    warn!(piece = i, error = %e, "piece download failed");
                    writer.close();
                    return;
                }
                None => {
                    writer.close();
                    return;
                }
            }
        };
        if writer.write(window.trim(index, &piece)).await.is_err() {
            debug!(piece = index, "bag reader gone");
            return;
        }
        drop(piece);
        enqueue(&mut next_job);
    }
    writer.finish();
}

async fn fetch_worker(
    downloader: Arc<dyn Downloader>,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<u32>>>,
    results: mpsc::Sender<PieceResult>,
    stop: CancellationToken,
) {
    loop {
        let next = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                job = jobs.recv() => job,
            }
        };
        let Some(index) = next else {
            return;
        };
        let started = tokio::time::Instant::now();
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            r = downloader.download_piece(index) => r,
        };
        debug!(piece = index, elapsed = ?started.elapsed(), "piece downloaded");
        if results.send((index, result)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBag;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    fn video_bag() -> (Arc<MemoryBag>, Vec<u8>) {
        let video = pattern(3000, 3);
        let bag = MemoryBag::new(1024, vec![("pad.bin", pattern(3072, 1)), ("video.mp4", video.clone())]);
        (Arc::new(bag), video)
    }

    #[tokio::test]
    async fn range_touches_only_covering_pieces() {
        let (bag, video) = video_bag();
        let mut resp = OrderedPieceAssembler::default()
            .serve(bag.clone(), "/video.mp4", Some("bytes=1000-1999"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 206);
        assert_eq!(resp.header("content-range"), Some("bytes 1000-1999/3000"));
        assert_eq!(resp.header("content-type"), Some("video/mp4"));
        assert_eq!(resp.content_length, Some(1000));
        let body = resp.body.read_to_end().await.unwrap();
        assert_eq!(body, &video[1000..2000]);
        assert_eq!(bag.fetched(), vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_pieces_come_out_in_order() {
        let file = pattern(64 * 300 + 17, 9);
        let mut bag = MemoryBag::new(64, vec![("blob.bin", file.clone())]);
        bag.scramble = true;
        let bag = Arc::new(bag);
        let mut resp = OrderedPieceAssembler::new(256)
            .serve(bag.clone(), "blob.bin", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("accept-ranges"), Some("bytes"));
        assert_eq!(resp.header("content-range"), None);
        assert_eq!(resp.content_length, Some(file.len() as u64));
        assert_eq!(resp.body.read_to_end().await.unwrap(), file);
        assert_eq!(bag.fetched(), (0..301).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let (bag, _) = video_bag();
        let mut resp = OrderedPieceAssembler::default()
            .serve(bag.clone(), "/nope.txt", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
        assert!(resp.body.read_to_end().await.unwrap().is_empty());
        assert!(bag.fetched().is_empty());
    }

    #[tokio::test]
    async fn bad_range_is_416() {
        let (bag, _) = video_bag();
        let err = OrderedPieceAssembler::default()
            .serve(bag.clone(), "/video.mp4", Some("bytes=2000-3000"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 416);
        let err = OrderedPieceAssembler::default()
            .serve(bag, "/video.mp4", Some("bytes=0-1,4-5"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 416);
    }

    #[tokio::test]
    async fn empty_path_serves_index() {
        let bag = Arc::new(MemoryBag::new(16, vec![("index.html", b"<html></html>".to_vec())]));
        let mut resp = OrderedPieceAssembler::default()
            .serve(bag, "/", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-type"), Some("text/html; charset=utf-8"));
        assert_eq!(resp.body.read_to_end().await.unwrap(), b"<html></html>");
    }

    #[tokio::test]
    async fn empty_file() {
        let bag = Arc::new(MemoryBag::new(16, vec![("a.txt", b"abc".to_vec()), ("empty.txt", vec![])]));
        let mut resp = OrderedPieceAssembler::default()
            .serve(bag, "empty.txt", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_length, Some(0));
        assert!(resp.body.read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn piece_failure_aborts_body() {
        let mut bag = MemoryBag::new(8, vec![("data.bin", pattern(80, 0))]);
        bag.fail_piece = Some(4);
        let mut resp = OrderedPieceAssembler::default()
            .serve(Arc::new(bag), "data.bin", None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(resp.body.read_to_end().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_body() {
        let mut bag = MemoryBag::new(8, vec![("data.bin", pattern(800, 0))]);
        bag.scramble = true;
        let cancel = CancellationToken::new();
        let mut resp = OrderedPieceAssembler::default()
            .serve(Arc::new(bag), "data.bin", None, &cancel)
            .await
            .unwrap();
        cancel.cancel();
        assert!(resp.body.read_to_end().await.is_err());
    }

    #[test]
    fn bag_paths() {
        assert_eq!(bag_path("/"), INDEX_FILE);
        assert_eq!(bag_path(""), INDEX_FILE);
        assert_eq!(bag_path("/css/site.css"), "css/site.css");
        assert_eq!(bag_path("/page.html?x=1"), "page.html");
    }
}
