//! # Starfall Load Bot
//!
//! Connects a swarm of simulated players to a Starfall server. Each bot
//! authenticates, wanders on legal random walks, swings at nearby players in
//! hostile zones and mines asteroids it passes. When the run ends the bots'
//! counters are summed and logged: how often the server corrected a
//! position, rate limited a client, or landed a hit.

mod bot;

use bot::{Bot, BotConfig, BotCounters, Reaction};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use starfall_core::{current_timestamp_ms, InboundEvent, OutboundEvent};
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Reconnects allowed per bot when the cluster redirects it.
const MAX_MIGRATIONS: u32 = 3;

#[derive(Parser, Debug, Clone)]
#[command(name = "starfall-bot")]
#[command(about = "Starfall load-test client: simulated players over WebSocket")]
struct Args {
    /// Server WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Number of simultaneous players to simulate. A default server admits
    /// 5 logins per IP per minute; raise `rate_limits.auth_attempts` for
    /// larger swarms from one host
    #[arg(short, long, default_value = "5")]
    players: u32,

    /// Position updates per second
    #[arg(short, long, default_value = "10.0")]
    move_freq: f64,

    /// Attack attempts per minute
    #[arg(short, long, default_value = "12.0")]
    attack_freq: f64,

    /// Mining attempts per minute
    #[arg(long, default_value = "6.0")]
    mine_freq: f64,

    /// Cruise speed in units per second
    #[arg(short, long, default_value = "200.0")]
    speed: f64,

    /// Simulation duration in seconds
    #[arg(short, long, default_value = "60")]
    duration: u64,

    /// Account name prefix; bot `i` logs in as `{prefix}{i}`
    #[arg(long, default_value = "bot")]
    prefix: String,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

/// How one connection ended.
enum SessionEnd {
    Finished,
    Migrate(String),
    Stopped,
}

async fn run_session(
    bot: &mut Bot,
    url: &str,
    args: &Args,
    deadline: Instant,
    rng: &mut StdRng,
) -> Result<SessionEnd, Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    info!("🎮 {} connected to {}", bot.name, url);

    let mut pending = vec![bot.authenticate()];

    let mut move_timer = interval(Duration::from_secs_f64(1.0 / args.move_freq));
    let mut attack_timer = interval(Duration::from_secs_f64(60.0 / args.attack_freq));
    let mut mine_timer = interval(Duration::from_secs_f64(60.0 / args.mine_freq));
    for timer in [&mut move_timer, &mut attack_timer, &mut mine_timer] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }
    let dt = 1.0 / args.move_freq;

    let end = loop {
        for event in pending.drain(..) {
            let json = serde_json::to_string(&event)?;
            ws_sender.send(Message::Text(json.into())).await?;
            bot.counters.sent += 1;
        }

        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let event: OutboundEvent = match serde_json::from_str(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("⚠️ {} could not parse server message: {}", bot.name, e);
                            continue;
                        }
                    };
                    debug!("📨 {} received {}", bot.name, event.kind());
                    match bot.apply(&event, current_timestamp_ms()) {
                        Reaction::None => {}
                        Reaction::Refused(reason) => {
                            warn!("❌ {} was refused: {}", bot.name, reason);
                            break SessionEnd::Stopped;
                        }
                        Reaction::Migrate { address } => {
                            info!("🔀 {} redirected to {}", bot.name, address);
                            break SessionEnd::Migrate(address);
                        }
                        Reaction::Replaced => {
                            warn!("🔁 {} session replaced by another login", bot.name);
                            break SessionEnd::Stopped;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("🔌 {} connection closed by server: {:?}", bot.name, frame);
                    break SessionEnd::Stopped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("⚠️ {} WebSocket error: {}", bot.name, e);
                    break SessionEnd::Stopped;
                }
                None => {
                    info!("🔌 {} connection closed (stream ended)", bot.name);
                    break SessionEnd::Stopped;
                }
            },
            _ = move_timer.tick() => {
                let now = current_timestamp_ms();
                if let Some(login) = bot.retry_authentication(now) {
                    pending.push(login);
                } else if let Some(respawn) = bot.respawn(now) {
                    pending.push(respawn);
                } else if let Some(step) = bot.next_move(dt, now, rng) {
                    pending.push(step);
                }
            }
            _ = attack_timer.tick() => {
                if let Some(attack) = bot.attack() {
                    pending.push(attack);
                }
            }
            _ = mine_timer.tick() => {
                if let Some(mine) = bot.mine() {
                    pending.push(mine);
                }
            }
            _ = sleep(Duration::from_millis(100)) => {
                if Instant::now() >= deadline {
                    break SessionEnd::Finished;
                }
            }
        }
    };

    if matches!(end, SessionEnd::Finished) {
        let goodbye = InboundEvent::Disconnect {
            reason: Some("simulation complete".to_string()),
        };
        let _ = ws_sender.send(Message::Text(serde_json::to_string(&goodbye)?.into())).await;
        let _ = ws_sender.close().await;
    }
    Ok(end)
}

/// Runs one bot for the whole simulation, following redirects.
async fn simulate_bot(index: u32, args: Args, seed: u64) -> BotCounters {
    let name = format!("{}{}", args.prefix, index);
    let mut bot = Bot::new(
        name,
        BotConfig {
            speed: args.speed,
            ..BotConfig::default()
        },
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut url = args.url.clone();
    let mut migrations = 0;

    loop {
        match run_session(&mut bot, &url, &args, deadline, &mut rng).await {
            Ok(SessionEnd::Migrate(address)) if migrations < MAX_MIGRATIONS => {
                migrations += 1;
                bot.reset_session();
                url = address;
            }
            Ok(SessionEnd::Migrate(_)) => {
                warn!("⚠️ {} gave up after {} redirects", bot.name, migrations);
                break;
            }
            Ok(_) => break,
            Err(e) => {
                error!("❌ {} simulation failed: {}", bot.name, e);
                break;
            }
        }
    }

    info!(
        "📊 {} final stats: sent {} | received {} | corrections {} | rate limited {}",
        bot.name, bot.counters.sent, bot.counters.received, bot.counters.corrections, bot.counters.rate_limited
    );
    bot.counters
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    if args.move_freq <= 0.0 || args.attack_freq <= 0.0 || args.mine_freq <= 0.0 {
        return Err("frequencies must be greater than 0".into());
    }

    info!("🚀 Starting Starfall load bot");
    info!("   • Players: {}", args.players);
    info!("   • Movement: {:.1} Hz at {:.0} units/s", args.move_freq, args.speed);
    info!("   • Attacks: {:.1}/min | Mining: {:.1}/min", args.attack_freq, args.mine_freq);
    info!("   • Duration: {} seconds", args.duration);
    info!("   • Server: {}", args.url);

    let base_seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let mut handles = Vec::new();
    for index in 0..args.players {
        let args = args.clone();
        handles.push(tokio::spawn(simulate_bot(index, args, base_seed.wrapping_add(u64::from(index)))));

        // Stagger connections
        sleep(Duration::from_millis(250)).await;
    }

    let mut total = BotCounters::default();
    for handle in handles {
        match handle.await {
            Ok(counters) => total += counters,
            Err(e) => error!("❌ Bot task failed: {}", e),
        }
    }

    info!("✅ Simulation complete");
    info!("📋 Totals across {} bots:", args.players);
    info!("   • Messages: {} sent, {} received", total.sent, total.received);
    info!("   • Position corrections: {}", total.corrections);
    info!("   • Rate limited: {} | Other rejections: {}", total.rate_limited, total.rejections);
    info!(
        "   • Hits: {} dealt, {} taken | Kills: {} | Deaths: {}",
        total.hits_dealt, total.hits_taken, total.kills, total.deaths
    );
    info!("   • Asteroids mined: {} ({} resources)", total.asteroids_mined, total.resources);
    info!("   • Migrations: {}", total.migrations);

    Ok(())
}
