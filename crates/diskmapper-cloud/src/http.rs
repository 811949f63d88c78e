use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use reqwest::blocking::Client;
use std::time::Duration;

/// Blocking client for link-local metadata services. Proxies are bypassed.
pub(crate) fn metadata_client(timeout: Duration) -> DiskMapperResult<Client> {
    Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
        .map_err(|err| {
            DiskMapperError::DiskPathResolution(format!("building metadata client: {err}"))
        })
}

/// GET `url` with `header` and return the body; non-2xx is an error.
pub(crate) fn get_text(client: &Client, url: &str, header: (&str, &str)) -> DiskMapperResult<String> {
    let response = client
        .get(url)
        .header(header.0, header.1)
        .send()
        .map_err(|err| DiskMapperError::Metadata(format!("{url}: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(DiskMapperError::Metadata(format!("{url} returned {status}")));
    }
    response
        .text()
        .map_err(|err| DiskMapperError::Metadata(format!("{url}: reading body: {err}")))
}
