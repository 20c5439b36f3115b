use clap::Parser;
use client::dialogue::{ConverseInput, ScriptedBackend};
use client::identity::{choose_avatar, IdentitySource, StaticIdentity};
use client::input::{sample_keys, InputManager};
use client::movement::{MoveInput, MovementSimulator};
use client::network::RemoteStore;
use client::proximity::ProximityEvent;
use client::rendering::{Renderer, UiConfig};
use client::scene::{PaletteLoader, SceneEntities};
use client::session::{FrameInput, GamePhase, Session, SessionConfig};
use client::store::{MemoryStore, PresenceStore};
use log::{error, info, warn};
use macroquad::prelude::*;
use shared::next_avatar;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Presence store address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Stable user id; a random guest id is used when omitted
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Display name shown above the avatar
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Avatar to start with; random when omitted
    #[arg(short = 'a', long)]
    avatar: Option<String>,

    /// Profile picture URL stored with the record
    #[arg(long)]
    photo_url: Option<String>,

    /// Run against an in-process store instead of the server
    #[arg(long)]
    offline: bool,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Window width
    #[arg(short = 'w', long, default_value = "960")]
    width: usize,

    /// Window height (no short flag to avoid conflict with --help)
    #[arg(long, default_value = "720")]
    height: usize,
}

fn window_conf() -> Conf {
    Conf {
        window_title: "Presence Office".to_string(),
        window_width: 960,
        window_height: 720,
        ..Default::default()
    }
}

type ClientSession = Session<Box<dyn PresenceStore>, SceneEntities, PaletteLoader>;

fn build_session(args: &Args) -> Result<ClientSession, Box<dyn std::error::Error>> {
    let mut rng = ::rand::thread_rng();

    let source = match &args.user {
        Some(id) => StaticIdentity::new(id.clone(), ""),
        None => StaticIdentity::guest(&mut rng),
    };
    let source = match &args.name {
        Some(name) => source.with_display_name(name.clone()),
        None => source,
    };
    let mut source = match &args.photo_url {
        Some(url) => source.with_photo_url(url.clone()),
        None => source,
    };
    let identity = source.authenticate()?;
    let avatar = choose_avatar(args.avatar.as_deref(), &mut rng)?;

    let store: Box<dyn PresenceStore> = if args.offline {
        info!("Running offline against an in-process store");
        Box::new(MemoryStore::new().connection())
    } else {
        info!("Connecting to: {}", args.server);
        Box::new(RemoteStore::new(&args.server, args.fake_ping)?)
    };

    let session = Session::new(
        identity,
        avatar.id,
        store,
        SceneEntities::new(),
        PaletteLoader::with_load_frames(2),
        Arc::new(ScriptedBackend::new()),
        SessionConfig::default(),
    )?;
    Ok(session)
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = build_session(&args)?;
    session.start()?;

    request_new_screen_size(args.width as f32, args.height as f32);
    prevent_quit();

    let mut renderer = Renderer::new(args.width, args.height)?;
    let mut input = InputManager::new();
    let mut chat_draft: Option<String> = None;
    let mut last_line: Option<String> = None;

    info!("Controls: WASD/arrows to move, Enter to join, C to change avatar");
    info!("M/V toggle mic/camera, T to talk to the Quest Giver, Esc to quit");

    loop {
        if is_quit_requested() {
            break;
        }
        let now = Instant::now();
        let frame_scale = MovementSimulator::frame_scale(get_frame_time());

        let mut movement = MoveInput::default();
        if let Some(draft) = chat_draft.as_mut() {
            while let Some(c) = get_char_pressed() {
                if !c.is_control() {
                    draft.push(c);
                }
            }
            if is_key_pressed(KeyCode::Backspace) {
                draft.pop();
            }
            if is_key_pressed(KeyCode::Escape) {
                chat_draft = None;
                input.reset();
            } else if is_key_pressed(KeyCode::Enter) {
                let text = std::mem::take(draft);
                chat_draft = None;
                input.reset();
                if let Err(e) = session.talk(ConverseInput::text(text)) {
                    warn!("Could not talk: {}", e);
                }
            }
        } else {
            let (controls, held) = input.update(sample_keys());
            movement = held;

            if controls.quit {
                break;
            }
            if controls.enter_world && session.phase() == GamePhase::Lobby {
                if let Err(e) = session.enter_world() {
                    warn!("Could not enter the world: {}", e);
                }
            }
            if controls.cycle_avatar && session.phase() == GamePhase::Lobby {
                let next = next_avatar(&session.local().avatar_id);
                if let Err(e) = session.select_avatar(next.id, now) {
                    warn!("Could not select avatar: {}", e);
                }
            }
            if controls.toggle_mic {
                let on = !session.local().capabilities.mic_on;
                session.set_mic(on, now);
            }
            if controls.toggle_camera {
                let on = !session.local().capabilities.camera_on;
                session.set_camera(on, now);
            }
            if controls.talk && session.proximity().is_near_npc() && !session.is_talking() {
                // Drop the 't' that opened the prompt.
                while get_char_pressed().is_some() {}
                chat_draft = Some(String::new());
            }
        }

        let report = session.tick(FrameInput {
            now,
            frame_scale,
            movement,
        });
        for event in &report.proximity {
            match event {
                ProximityEvent::NpcLeft => last_line = None,
                ProximityEvent::PeerEntered(id) => info!("{} is close enough to talk", id),
                ProximityEvent::PeerLeft(id) => info!("{} moved away", id),
                ProximityEvent::NpcEntered => {}
            }
        }
        if let Some(line) = report.dialogue {
            last_line = Some(line.text);
        }

        let ui = UiConfig {
            phase: session.phase(),
            connected: session.store().is_connected(),
            offline_mode: args.offline,
            fake_ping_ms: args.fake_ping,
            player_count: session.reconciler().len() + 1,
            near_npc: session.proximity().is_near_npc(),
            near_peers: session.proximity().near_peers().len(),
            chat_draft: chat_draft.clone(),
            dialogue: last_line.clone(),
            waiting_for_reply: session.is_talking(),
        };
        renderer.render(
            session.map(),
            session.npc(),
            session.scene(),
            session.local(),
            &ui,
        );

        next_frame().await;
    }

    session.stop();
    Ok(())
}

#[macroquad::main(window_conf)]
async fn main() {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    if let Err(e) = run(args).await {
        error!("Client error: {}", e);
        eprintln!("Client error: {}", e);
        std::process::exit(1);
    }
}
