//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 响应体流式阶段
//!
//! 控制流阶段完成后，响应体分片按声明顺序依次经过可流式处理的策略。
//! 流是惰性的：下游拉取一个分片，上游才产生一个分片。

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

use super::Policy;
use crate::error::GatewayError;

/// 响应体流
pub type BodyStream = BoxStream<'static, Result<Bytes, GatewayError>>;

/// 单个分片的响应体
pub fn once(body: Bytes) -> BodyStream {
    stream::once(async move { Ok(body) }).boxed()
}

/// 空响应体
pub fn empty() -> BodyStream {
    stream::empty().boxed()
}

/// 让响应体依次经过可流式处理的策略
///
/// 任一策略转换失败时，该错误作为流的下一项返回。
pub fn transform_stream(policies: Vec<Arc<dyn Policy>>, source: BodyStream) -> BodyStream {
    if policies.is_empty() {
        return source;
    }

    source
        .map(move |chunk| {
            chunk.and_then(|chunk| {
                policies
                    .iter()
                    .try_fold(chunk, |chunk, policy| policy.transform_chunk(chunk))
            })
        })
        .boxed()
}

/// 收集整个响应体
pub async fn collect_body(mut body: BodyStream) -> Result<Bytes, GatewayError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
