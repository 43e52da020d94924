use log::{debug, warn};
use reqwest::{Client, Response, header::CONTENT_LENGTH};
use crate::download::config::Config;
use crate::download::error::DownloadError;

/// Client 内部拥有连接池，所有 chunk 共享同一个
pub fn build_http_client(config: &Config) -> Result<Client, DownloadError> {
    let client = Client::builder()
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .build()?;

    Ok(client)
}

fn content_length(response: &Response) -> Result<u64, String> {
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }

    let length = response
        .headers()
        .get(CONTENT_LENGTH)
        .ok_or_else(|| "missing Content-Length".to_string())?
        .to_str()
        .map_err(|err| err.to_string())?
        .parse::<u64>()
        .map_err(|err| format!("invalid Content-Length: {}", err))?;

    if length == 0 {
        Err("empty Content-Length".to_string())
    } else {
        Ok(length)
    }
}

/// Asks the server for the size of `url`: HEAD first, then a plain GET whose
/// body is dropped as soon as the headers are in.
pub async fn probe_content_length(client: &Client, url: &str) -> Result<u64, DownloadError> {
    let head_failure = match client.head(url).send().await {
        Ok(response) => match content_length(&response) {
            Ok(length) => return Ok(length),
            Err(reason) => reason,
        },
        Err(err) => err.to_string(),
    };
    debug!("HEAD {} gave no usable size ({}), falling back to GET", url, head_failure);

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| DownloadError::SizeProbeFailed { url: url.to_string(), reason: err.to_string() })?;

    content_length(&response).map_err(|reason| {
        warn!("Get file size failed: {} ({})", url, reason);
        DownloadError::SizeProbeFailed { url: url.to_string(), reason }
    })
}
