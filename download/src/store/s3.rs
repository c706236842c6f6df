//! Range reads through the S3 `GetObject` API.

use super::Store;
use crate::Error;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use tracing::debug;

/// HTTP status returned when the requested range starts past the end of the object.
const RANGE_NOT_SATISFIABLE: u16 = 416;

/// Objects served by Amazon S3 (or any S3-compatible service).
#[derive(Clone)]
pub struct S3 {
    client: Client,
}

impl S3 {
    /// Read ranges with `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Store for S3 {
    type Body = BoxStream<'static, Result<Bytes, Error>>;

    async fn fetch_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Self::Body, Error> {
        let result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={start}-{end}"))
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                // Check the status before consuming the error
                let unsatisfiable = e
                    .raw_response()
                    .filter(|r| r.status().as_u16() == RANGE_NOT_SATISFIABLE)
                    .map(|r| r.headers().get("content-range").and_then(object_len));
                return match unsatisfiable {
                    // S3 rejects a range starting exactly at the end of the object
                    Some(Some(len)) if start == len => {
                        debug!(bucket, key, start, "range starts at end of object");
                        Ok(stream::empty().boxed())
                    }
                    Some(len) => Err(Error::OffsetBeyondEnd { offset: start, len }),
                    None => Err(Error::transport(aws_sdk_s3::Error::from(
                        e.into_service_error(),
                    ))),
                };
            }
        };

        let body = stream::unfold(output.body, |mut body| async move {
            body.next()
                .await
                .map(|segment| (segment.map_err(Error::transport), body))
        });
        Ok(body.boxed())
    }
}

/// Parse the object length from an unsatisfied `Content-Range` header (`bytes */LEN`).
fn object_len(content_range: &str) -> Option<u64> {
    content_range
        .trim()
        .strip_prefix("bytes */")?
        .parse()
        .ok()
}
