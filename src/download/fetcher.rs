use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use headers::HeaderMapExt;
use log::warn;
use reqwest::{Client, Request, StatusCode};
use crate::download::chunk_range::ChunkRange;
use crate::download::error::DownloadError;

pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// One HTTP range request. The body is consumed once; every attempt needs a new fetcher.
pub struct RangeFetcher {
    client: Client,
    url: String,
    range: ChunkRange,
    block_size: usize,
}

impl RangeFetcher {
    pub fn new(client: Client, url: impl Into<String>, range: ChunkRange) -> Self {
        Self {
            client,
            url: url.into(),
            range,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn range(&self) -> ChunkRange {
        self.range
    }

    fn request_failed(&self, reason: impl ToString) -> DownloadError {
        DownloadError::RangeRequestFailed {
            range: self.range.to_string(),
            reason: reason.to_string(),
        }
    }

    fn create_http_request(&self) -> Result<Request, DownloadError> {
        let mut request = self.client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "*/*")
            .build()
            .map_err(|err| self.request_failed(err))?;

        let header_map = request.headers_mut();
        header_map.typed_insert(headers::Connection::keep_alive());
        header_map.typed_insert(
            self.range
                .to_range_header()
                .ok_or_else(|| self.request_failed("invalid range"))?
        );

        Ok(request)
    }

    /// Sends the request and returns the body as blocks of at most `block_size` bytes.
    pub async fn open(self) -> Result<impl Stream<Item = Result<Bytes, DownloadError>> + Send + 'static, DownloadError> {
        let request = self.create_http_request()?;
        let response = self.client
            .execute(request)
            .await
            .map_err(|err| self.request_failed(err))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                warn!("Server ignored range {} of {}, reading the full body", self.range, self.url);
            }
            status => return Err(self.request_failed(format!("HTTP {}", status))),
        }

        let range = self.range.to_string();
        let block_size = self.block_size;
        let stream = response.bytes_stream();

        Ok(async_stream::stream! {
            futures_util::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(mut bytes) => {
                        while bytes.len() > block_size {
                            yield Ok(bytes.split_to(block_size));
                        }
                        if !bytes.is_empty() {
                            yield Ok(bytes);
                        }
                    }
                    Err(err) => {
                        yield Err(DownloadError::RangeRequestFailed {
                            range: range.clone(),
                            reason: err.to_string(),
                        });
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn collect(fetcher: RangeFetcher) -> Result<Vec<Bytes>, DownloadError> {
        let stream = fetcher.open().await?;
        futures_util::pin_mut!(stream);

        let mut blocks = Vec::new();
        while let Some(block) = stream.next().await {
            blocks.push(block?);
        }

        Ok(blocks)
    }

    #[tokio::test]
    async fn should_request_range_and_yield_small_blocks() {
        let body = create_body(20_000);
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/file.bin")
            .match_header("range", "bytes=1000-20999")
            .with_status(206)
            .with_body(&body)
            .create_async()
            .await;

        let url = format!("{}/file.bin", server.url());
        let fetcher = RangeFetcher::new(Client::new(), url, ChunkRange::new(1000, 20_999));
        let blocks = collect(fetcher).await.unwrap();

        assert!(blocks.iter().all(|b| b.len() <= DEFAULT_BLOCK_SIZE));
        assert_eq!(blocks.concat(), body);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn should_accept_full_content_reply() {
        let body = create_body(300);
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/file.bin")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let url = format!("{}/file.bin", server.url());
        let fetcher = RangeFetcher::new(Client::new(), url, ChunkRange::new(0, 99)).with_block_size(64);
        let blocks = collect(fetcher).await.unwrap();

        assert!(blocks.iter().all(|b| b.len() <= 64));
        assert_eq!(blocks.concat(), body);
    }

    #[tokio::test]
    async fn should_fail_on_server_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/file.bin")
            .with_status(500)
            .create_async()
            .await;

        let url = format!("{}/file.bin", server.url());
        let fetcher = RangeFetcher::new(Client::new(), url, ChunkRange::new(0, 99));

        match collect(fetcher).await {
            Err(DownloadError::RangeRequestFailed { range, reason }) => {
                assert_eq!(range, "0-99");
                assert!(reason.contains("500"));
            }
            other => panic!("unexpected result: {:?}", other.map(|b| b.len())),
        }
    }
}
