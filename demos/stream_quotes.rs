/// Streams level one equity quotes and prints each update.
///
/// Reads the OAuth access token from `TD_ACCESS_TOKEN` and the symbols from
/// the command line (default: SPY QQQ).
use std::env;

use td_sdk::schema::{decoded, LevelOneEquity};
use td_sdk::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let token = env::var("TD_ACCESS_TOKEN")?;
    let mut symbols: Vec<String> = env::args().skip(1).collect();
    if symbols.is_empty() {
        symbols = vec!["SPY".to_string(), "QQQ".to_string()];
    }
    let symbols: Vec<&str> = symbols.iter().map(String::as_str).collect();

    let api = TdApi::with_token(token);
    let client = StreamingClient::from_api(&api, StreamConfig::default())
        .await?
        .on_stream_restarted(Callback::new(|_: &()| println!("-- stream restarted --")));
    client.open_stream()?;

    let quotes = decoded(|_, records: Vec<LevelOneEquity>| {
        for q in records {
            println!(
                "{:<6} bid={:>10} ask={:>10} last={:>10}",
                q.symbol,
                fmt_price(q.bid_price),
                fmt_price(q.ask_price),
                fmt_price(q.last_price)
            );
        }
    });
    client.add_handler(FrameKind::Data, Service::Quote, quotes)?;

    let id = client.services().level_one_quotes(&symbols, None).await?;
    println!("Subscribed to {symbols:?} (requestid={id})");

    tokio::select! {
        result = client.join() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down...");
            client.shutdown().await?;
        }
    }
    Ok(())
}

fn fmt_price(price: Option<f64>) -> String {
    price.map(|p| format!("{p:.2}")).unwrap_or_else(|| "-".into())
}
