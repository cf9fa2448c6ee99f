use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use streamfold_api::{Codec, LogPublisher};

use crate::config::SourceConfig;
use crate::error::PipelineError;

// ═══════════════════════════════════════════════════════════════
//  Line source — TCP → lines → log.publish()
// ═══════════════════════════════════════════════════════════════

/// TCP listener: каждая строка каждого соединения — одна запись topic'а.
///
/// Ключ записи — естественный ключ декодированной строки (станция,
/// пользователь), чтобы записи одного ключа попадали в одну партицию.
/// Не декодирующиеся строки публикуются с пустым ключом: отбрасывает и
/// считает их pipeline.
pub struct LineSource {
    name: String,
    topic: String,
    max_line: usize,
    listener: TcpListener,
    codec: Option<Arc<dyn Codec>>,
    log: Arc<dyn LogPublisher>,
}

impl LineSource {
    pub async fn bind(
        config: &SourceConfig,
        codec: Option<Arc<dyn Codec>>,
        log: Arc<dyn LogPublisher>,
    ) -> Result<Self, PipelineError> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| PipelineError::SourceBind {
                addr: config.listen.clone(),
                source,
            })?;
        Ok(Self {
            name: config.name.clone(),
            topic: config.topic.clone(),
            max_line: config.max_line,
            listener,
            codec,
            log,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Принимать соединения до отмены `token`.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let shared = Arc::new(Connection {
                name: self.name.clone(),
                topic: self.topic,
                max_line: self.max_line,
                codec: self.codec,
                log: self.log,
            });
            tracing::info!(source = %self.name, addr = ?self.listener.local_addr().ok(), topic = %shared.topic, "source listening");

            loop {
                tokio::select! {
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!(source = %self.name, %peer, "new connection");
                            let conn = Arc::clone(&shared);
                            let conn_token = token.clone();
                            tokio::spawn(async move {
                                conn.serve(stream, conn_token).await;
                                tracing::info!(source = %conn.name, %peer, "connection closed");
                            });
                        }
                        Err(e) => {
                            tracing::error!(source = %self.name, error = ?e, "accept error");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }

            tracing::info!(source = %self.name, "finished");
        })
    }
}

struct Connection {
    name: String,
    topic: String,
    max_line: usize,
    codec: Option<Arc<dyn Codec>>,
    log: Arc<dyn LogPublisher>,
}

impl Connection {
    fn key_for(&self, line: &str) -> String {
        self.codec
            .as_ref()
            .and_then(|codec| codec.decode(line.as_bytes()).ok())
            .map(|record| record.natural_key().to_string())
            .unwrap_or_default()
    }

    async fn serve(&self, stream: TcpStream, token: CancellationToken) {
        let mut lines = FramedRead::new(stream, SourceLines::new(self.max_line));
        loop {
            let line = tokio::select! {
                line = lines.next() => line,
                _ = token.cancelled() => break,
            };
            let line = match line {
                Some(Ok(Line::Text(line))) => line,
                Some(Ok(Line::TooLong)) => {
                    tracing::warn!(source = %self.name, max = self.max_line, "line too long, dropped");
                    continue;
                }
                None => break,
                Some(Err(e)) => {
                    tracing::warn!(source = %self.name, error = ?e, "read error");
                    break;
                }
            };

            let line = line.as_str();
            if line.trim().is_empty() {
                continue;
            }

            let key = self.key_for(line);
            match self.log.publish(&self.topic, &key, line.as_bytes().to_vec()).await {
                Ok(ack) => tracing::trace!(
                    source = %self.name, %key, partition = ack.partition, offset = ack.offset,
                    "line published"
                ),
                Err(e) => tracing::error!(source = %self.name, topic = %self.topic, error = ?e, "publish error"),
            }
        }
    }
}

enum Line {
    Text(String),
    /// Строка длиннее `max_line`: буфер сброшен, остаток до `\n` пропускается.
    TooLong,
}

/// `LinesCodec` с ограничением длины. Переполнение не завершает поток
/// (FramedRead после ошибки decoder'а закрывается), а отдаётся как
/// `Line::TooLong`.
struct SourceLines(LinesCodec);

impl SourceLines {
    fn new(max_line: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_line))
    }

    fn map(decoded: Result<Option<String>, LinesCodecError>) -> Result<Option<Line>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(Line::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Line::TooLong)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for SourceLines {
    type Item = Line;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, LinesCodecError> {
        Self::map(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, LinesCodecError> {
        Self::map(self.0.decode_eof(buf))
    }
}
