use std::collections::HashSet;
use std::time::Duration;

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;

use crate::clock::CountdownTimer;
use crate::error::StreamError;
use crate::models::ValidUrl;

/// Lazy, finite sequence of audio chunks. Each yielded chunk is a suspension
/// point, so a cancelling caller is observed within one chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// ICY streams never terminate on their own; HLS segment lists are polled.
const HLS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Some stations answer 403 to unknown agents.
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:100.0) Gecko/20100101 Firefox/100.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Continuous HTTP body (Shoutcast/Icecast).
    Icy,
    /// `.m3u8` playlist advertising media segments.
    Hls,
}

impl StreamKind {
    /// The URL suffix is the only place stream shape influences behaviour.
    pub fn for_url(url: &ValidUrl) -> Self {
        if url.as_str().ends_with(".m3u8") {
            StreamKind::Hls
        } else {
            StreamKind::Icy
        }
    }
}

/// Shared chunked HTTP client. Bodies are streamed, never buffered whole;
/// yielded chunks are capped at `chunk_size` bytes.
#[derive(Clone)]
pub struct HttpStreamClient {
    client: reqwest::Client,
    chunk_size: usize,
}

impl HttpStreamClient {
    pub fn new(chunk_size: usize) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client, chunk_size })
    }

    /// Open a GET and yield body chunks until the upstream closes.
    pub fn get_stream(&self, url: &ValidUrl) -> ByteStream {
        let client = self.client.clone();
        let chunk_size = self.chunk_size;
        let url = url.clone();

        Box::pin(try_stream! {
            debug!(url = %url, "fetching stream");
            let response = client
                .get(url.as_str())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| StreamError::Http { url: url.to_string(), source: e })?;

            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let mut chunk =
                    chunk.map_err(|e| StreamError::Http { url: url.to_string(), source: e })?;
                while chunk.len() > chunk_size {
                    yield chunk.split_to(chunk_size);
                }
                if !chunk.is_empty() {
                    yield chunk;
                }
            }
        })
    }

    /// Small non-streamed GET, used for playlists.
    pub async fn get_bytes(&self, url: &ValidUrl) -> Result<Bytes, StreamError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StreamError::Http {
                url: url.to_string(),
                source: e,
            })?;
        response.bytes().await.map_err(|e| StreamError::Http {
            url: url.to_string(),
            source: e,
        })
    }
}

/// Produces the finite chunk sequence for one recording task. The countdown
/// must already be running; it is the only exit for ICY streams.
pub struct StreamFetcher {
    client: HttpStreamClient,
}

impl StreamFetcher {
    pub fn new(chunk_size: usize) -> reqwest::Result<Self> {
        Ok(Self {
            client: HttpStreamClient::new(chunk_size)?,
        })
    }

    pub fn fetch(&self, url: &ValidUrl, countdown: CountdownTimer) -> ByteStream {
        match StreamKind::for_url(url) {
            StreamKind::Icy => bounded_by_countdown(self.client.get_stream(url), countdown),
            StreamKind::Hls => {
                fetch_hls(self.client.clone(), url.clone(), countdown, HLS_POLL_INTERVAL)
            }
        }
    }
}

/// Pass chunks through until the countdown expires. The check runs after
/// every chunk, so the sequence ends within one chunk of expiry.
fn bounded_by_countdown(inner: ByteStream, countdown: CountdownTimer) -> ByteStream {
    Box::pin(try_stream! {
        let mut inner = inner;
        while let Some(chunk) = inner.next().await {
            yield chunk?;
            if countdown.expired() {
                debug!("countdown expired");
                break;
            }
        }
    })
}

fn fetch_hls(
    client: HttpStreamClient,
    url: ValidUrl,
    countdown: CountdownTimer,
    poll_interval: Duration,
) -> ByteStream {
    Box::pin(try_stream! {
        // Seed with everything but the newest segment, so recording starts
        // from the most recent one.
        let initial = load_segment_uris(&client, &url).await?;
        let mut recorded = seed_recorded(&initial);

        'poll: while !countdown.expired() {
            let segments = load_segment_uris(&client, &url).await?;
            let new = select_new(segments, &recorded);
            debug!(url = %url, count = new.len(), "new playlist segments");

            for uri in &new {
                let segment_url = url.join(uri).map_err(|_| StreamError::SegmentUrl {
                    url: url.to_string(),
                    segment: uri.clone(),
                })?;
                let mut segment = client.get_stream(&segment_url);
                while let Some(chunk) = segment.next().await {
                    yield chunk?;
                    if countdown.expired() {
                        debug!("countdown expired");
                        break 'poll;
                    }
                }
            }
            recorded.extend(new);

            tokio::time::sleep(poll_interval).await;
        }
    })
}

async fn load_segment_uris(
    client: &HttpStreamClient,
    url: &ValidUrl,
) -> Result<Vec<String>, StreamError> {
    let bytes = client.get_bytes(url).await?;
    parse_segment_uris(&bytes, url)
}

fn parse_segment_uris(bytes: &[u8], url: &ValidUrl) -> Result<Vec<String>, StreamError> {
    match m3u8_rs::parse_playlist_res(bytes) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => Ok(playlist
            .segments
            .into_iter()
            .map(|segment| segment.uri)
            .collect()),
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(StreamError::Playlist {
            url: url.to_string(),
            message: "expected a media playlist, got a master playlist".to_string(),
        }),
        Err(e) => Err(StreamError::Playlist {
            url: url.to_string(),
            message: e.to_string(),
        }),
    }
}

fn seed_recorded(initial: &[String]) -> HashSet<String> {
    initial.iter().rev().skip(1).cloned().collect()
}

/// Segments not recorded yet, in playlist order.
fn select_new(segments: Vec<String>, recorded: &HashSet<String>) -> Vec<String> {
    segments
        .into_iter()
        .filter(|uri| !recorded.contains(uri))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::testing::TokioClock;

    fn url(s: &str) -> ValidUrl {
        ValidUrl::parse(s).unwrap()
    }

    fn uris(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stream_kind_dispatches_on_playlist_suffix() {
        assert_eq!(
            StreamKind::for_url(&url("http://example.invalid/radio")),
            StreamKind::Icy
        );
        assert_eq!(
            StreamKind::for_url(&url("http://example.invalid/live/playlist.m3u8")),
            StreamKind::Hls
        );
    }

    #[test]
    fn segment_bookkeeping_starts_from_the_most_recent_and_deduplicates() {
        // Polls advance the playlist one segment at a time; only segments
        // never seen before are recorded, in playlist order.
        let mut recorded = seed_recorded(&uris(&["s1", "s2", "s3"]));
        assert_eq!(recorded.len(), 2);

        let first = select_new(uris(&["s2", "s3", "s4"]), &recorded);
        assert_eq!(first, uris(&["s3", "s4"]));
        recorded.extend(first);

        let second = select_new(uris(&["s3", "s4", "s5"]), &recorded);
        assert_eq!(second, uris(&["s5"]));
    }

    #[test]
    fn media_playlist_parses_to_segment_uris() {
        let playlist = b"#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:100\n\
#EXTINF:6.0,\n\
segment-100.ts\n\
#EXTINF:6.0,\n\
segment-101.ts\n";
        let parsed =
            parse_segment_uris(playlist, &url("http://example.invalid/live/playlist.m3u8"))
                .unwrap();
        assert_eq!(parsed, uris(&["segment-100.ts", "segment-101.ts"]));
    }

    #[test]
    fn master_playlist_is_rejected() {
        let playlist = b"#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=128000\n\
low/playlist.m3u8\n";
        let result =
            parse_segment_uris(playlist, &url("http://example.invalid/live/playlist.m3u8"));
        assert!(matches!(result, Err(StreamError::Playlist { .. })));
    }

    #[test]
    fn segment_urls_resolve_against_the_playlist() {
        let playlist = url("http://example.invalid/live/playlist.m3u8");
        assert_eq!(
            playlist.join("segment-1.ts").unwrap().as_str(),
            "http://example.invalid/live/segment-1.ts"
        );
        assert_eq!(
            playlist
                .join("http://cdn.example.invalid/segment-1.ts")
                .unwrap()
                .as_str(),
            "http://cdn.example.invalid/segment-1.ts"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_bounds_a_chunk_stream() {
        let clock = Arc::new(TokioClock::at("2024-01-15T08:00:00Z".parse().unwrap()));
        let mut countdown = CountdownTimer::new(chrono::Duration::seconds(1), clock);
        countdown.start().unwrap();

        // One chunk every 100 ms, forever.
        let inner: ByteStream = Box::pin(try_stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                yield Bytes::from_static(b"x");
            }
        });

        let chunks: Vec<_> = bounded_by_countdown(inner, countdown).collect().await;
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.is_ok()));
    }
}
