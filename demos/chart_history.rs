/// Fetches one day of five-minute futures bars and prints them.
///
/// Reads the OAuth access token from `TD_ACCESS_TOKEN`; the symbol comes
/// from the first argument (default: /ES).
use std::env;
use std::time::Duration;

use futures_util::StreamExt;
use td_sdk::schema::{ChartHistorySnapshot, StreamRecord};
use td_sdk::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let token = env::var("TD_ACCESS_TOKEN")?;
    let symbol = env::args().nth(1).unwrap_or_else(|| "/ES".to_string());

    let api = TdApi::with_token(token);
    let client = StreamingClient::from_api(&api, StreamConfig::default()).await?;
    client.open_stream()?;

    let mut snapshots = client.stream(FrameKind::Snapshot, Service::ChartHistoryFutures)?;
    client
        .services()
        .futures_chart_history(
            &symbol,
            ChartFuturesFrequency::FiveMinute,
            ChartHistoryRange::Period(ChartFuturesPeriod::OneDay),
        )
        .await?;

    let msg = tokio::time::timeout(Duration::from_secs(30), snapshots.next())
        .await?
        .ok_or("stream closed before the snapshot arrived")?;

    for snapshot in ChartHistorySnapshot::from_message(&msg)? {
        println!("{} ({} bars)", snapshot.symbol, snapshot.bars.len());
        for bar in &snapshot.bars {
            let time = chrono::DateTime::from_timestamp_millis(bar.timestamp)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| bar.timestamp.to_string());
            println!(
                "  {time} o={:.2} h={:.2} l={:.2} c={:.2} v={}",
                bar.open, bar.high, bar.low, bar.close, bar.volume
            );
        }
    }

    client.shutdown().await?;
    Ok(())
}
