use futures::StreamExt;
use log::debug;
use sluice_server::retry::RetryStrategy;
use tonic::transport::Channel;

use crate::error::ExecutionResult;
use crate::pipe::{PipeReader, PipeWriter};
use crate::plan::Location;
use crate::rpc::ClientOptions;
use crate::worker::rpc::shard_service_client::ShardServiceClient;
use crate::worker::rpc::write_shard_request::Payload;
use crate::worker::rpc::{ReadShardRequest, ShardChunk, WriteShardHeader, WriteShardRequest};

async fn dial(
    location: &Location,
    enable_tls: bool,
    retry: &RetryStrategy,
) -> ExecutionResult<ShardServiceClient<Channel>> {
    let options = ClientOptions::for_location(location, enable_tls);
    let url = options.to_url_string();
    retry
        .run(|| {
            let url = url.clone();
            async move {
                Ok::<_, crate::error::ExecutionError>(ShardServiceClient::connect(url).await?)
            }
        })
        .await
}

/// Establish a read stream for a shard on a peer and forward its frames
/// into the local pipe writer. The writer is closed on remote end of
/// stream or failure. A peer that does not yet hold the shard parks the
/// request server-side, so a registered-but-still-arriving shard is
/// never an error.
pub async fn dial_read_channel(
    location: Location,
    name: String,
    writer: PipeWriter,
    enable_tls: bool,
    retry: RetryStrategy,
) -> ExecutionResult<()> {
    let mut client = dial(&location, enable_tls, &retry).await?;
    debug!("reading shard {name} from {}:{}", location.host, location.port);
    let mut stream = client
        .read_shard(ReadShardRequest { name })
        .await?
        .into_inner();
    while let Some(chunk) = stream.message().await? {
        writer.write(chunk.data.into()).await?;
    }
    Ok(())
}

/// Declare a shard with its expected reader count on a peer and forward
/// frames from the local pipe reader until end of stream.
pub async fn dial_write_channel(
    location: Location,
    name: String,
    reader: PipeReader,
    reader_count: u32,
    on_disk: bool,
    enable_tls: bool,
    retry: RetryStrategy,
) -> ExecutionResult<()> {
    let mut client = dial(&location, enable_tls, &retry).await?;
    debug!("writing shard {name} to {}:{}", location.host, location.port);
    let header = WriteShardRequest {
        payload: Some(Payload::Header(WriteShardHeader {
            name,
            reader_count,
            on_disk,
        })),
    };
    let frames = reader.map(|data| WriteShardRequest {
        payload: Some(Payload::Chunk(ShardChunk {
            data: data.to_vec(),
        })),
    });
    let outbound = futures::stream::iter([header]).chain(frames);
    client.write_shard(outbound).await?;
    Ok(())
}
