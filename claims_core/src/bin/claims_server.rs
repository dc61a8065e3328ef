use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use bevy::app::App;
use bevy::prelude::Mut;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{error, info, warn};
use uuid::Uuid;

use claims_core::network::{start_player_server, NetworkEvent, PlayerServer};
use claims_core::{
    build_claims_app_with_backend, load_claims_config_from_env, receive_serverbound, run_tick,
    shutdown_claims_app, ChunkPos, ClaimRequestQueue, ClaimsManager, ClaimsMetrics, ClaimsPersistence,
    ConfirmationQueue, ConnectionEvents, DimensionId, JsonDirectoryBackend, PacketOutbox,
    PlayerId, PlayerLocation,
};
use claims_proto::decode_serverbound;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (config, metadata) = load_claims_config_from_env();
    let backend = JsonDirectoryBackend::new(config.persistence.data_dir.clone());
    let mut app = match build_claims_app_with_backend(config.clone(), Box::new(backend)) {
        Ok(app) => app,
        Err(err) => {
            error!(target: "claims::server", error = %err, "claims.load_failed");
            std::process::exit(1);
        }
    };

    let player_server = start_player_server(config.server.player_bind);
    let command_rx = match spawn_command_listener(config.server.command_bind) {
        Ok(receiver) => receiver,
        Err(err) => {
            error!(
                target: "claims::server",
                bind = %config.server.command_bind,
                error = %err,
                "command_listener.bind_failed"
            );
            std::process::exit(1);
        }
    };

    info!(
        command_bind = %config.server.command_bind,
        player_bind = %config.server.player_bind,
        config = ?metadata.path(),
        "Claims headless server ready"
    );

    let tick_length = Duration::from_millis(config.general.tick_millis.max(1));
    let mut locations: HashMap<PlayerId, PlayerLocation> = HashMap::new();
    'ticks: loop {
        let started = Instant::now();

        loop {
            match command_rx.try_recv() {
                Ok(Command::Stop) => break 'ticks,
                Ok(command) => apply_command(&mut app, &mut locations, command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'ticks,
            }
        }
        if let Some(server) = player_server.as_ref() {
            route_network_events(&mut app, server, &mut locations);
        }

        run_tick(&mut app);

        let frames = app.world.resource_mut::<PacketOutbox>().drain();
        if let Some(server) = player_server.as_ref() {
            for (player, frame) in frames {
                server.send(player, frame);
            }
        }

        if let Some(remaining) = tick_length.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    if let Err(err) = shutdown_claims_app(&mut app) {
        error!(target: "claims::server", error = %err, "claims.final_save_failed");
        std::process::exit(1);
    }
    info!(target: "claims::server", "Claims headless server stopped");
}

fn route_network_events(
    app: &mut App,
    server: &PlayerServer,
    locations: &mut HashMap<PlayerId, PlayerLocation>,
) {
    for event in server.events().try_iter() {
        match event {
            NetworkEvent::Connected(player) => {
                locations.insert(player, spawn_location());
                app.world.resource_mut::<ConnectionEvents>().join(player);
            }
            NetworkEvent::Disconnected(player) => {
                locations.remove(&player);
                app.world.resource_mut::<ConnectionEvents>().leave(player);
            }
            NetworkEvent::Frame(player, bytes) => {
                let packet = match decode_serverbound(&bytes) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!(
                            target: "claims::server",
                            %player,
                            error = %err,
                            "packet.decode_failed"
                        );
                        continue;
                    }
                };
                let location = locations
                    .get(&player)
                    .cloned()
                    .unwrap_or_else(spawn_location);
                app.world
                    .resource_scope(|world, mut requests: Mut<ClaimRequestQueue>| {
                        let mut confirmations = world.resource_mut::<ConfirmationQueue>();
                        receive_serverbound(
                            &mut requests,
                            &mut confirmations,
                            player,
                            location,
                            packet,
                        );
                    });
            }
        }
    }
}

fn spawn_location() -> PlayerLocation {
    PlayerLocation::new(DimensionId::overworld(), ChunkPos::new(0, 0))
}

fn apply_command(
    app: &mut App,
    locations: &mut HashMap<PlayerId, PlayerLocation>,
    command: Command,
) {
    match command {
        Command::Op(player) => {
            app.world
                .resource_mut::<ClaimsManager>()
                .grant_server_permission(player);
            info!(target: "claims::server", %player, "command.applied=op");
        }
        Command::Deop(player) => {
            app.world
                .resource_mut::<ClaimsManager>()
                .revoke_server_permission(player);
            info!(target: "claims::server", %player, "command.applied=deop");
        }
        Command::Move {
            player,
            dimension,
            chunk,
        } => {
            info!(
                target: "claims::server",
                %player,
                dimension = %dimension,
                %chunk,
                "command.applied=move"
            );
            locations.insert(player, PlayerLocation::new(dimension, chunk));
        }
        Command::Expire(player) => {
            let expired = app.world.resource_mut::<ClaimsManager>().expire_owner(player);
            info!(target: "claims::server", %player, expired, "command.applied=expire");
        }
        Command::Status => {
            let metrics = app.world.resource::<ClaimsMetrics>();
            info!(
                target: "claims::server",
                tick = metrics.tick,
                regions = metrics.regions,
                claim_states = metrics.claim_states,
                owners = metrics.owners,
                online = metrics.online_players,
                tickets = metrics.tickets_enabled,
                bytes_queued = metrics.bytes_queued,
                sync_tasks = metrics.sync_tasks,
                replacement_tasks = metrics.replacement_tasks,
                "claims.status"
            );
        }
        Command::Save => {
            let records = app.world.resource::<ClaimsManager>().all_records();
            let owners = records.len();
            let Some(persistence) = app.world.get_resource::<ClaimsPersistence>() else {
                warn!(target: "claims::server", "command.rejected=save storage_disabled");
                return;
            };
            match persistence.submit(records) {
                Ok(()) => info!(target: "claims::server", owners, "command.applied=save"),
                Err(err) => error!(target: "claims::server", error = %err, "claims.save_failed"),
            }
        }
        Command::Stop => {}
    }
}

#[derive(Debug)]
enum Command {
    Op(PlayerId),
    Deop(PlayerId),
    Move {
        player: PlayerId,
        dimension: DimensionId,
        chunk: ChunkPos,
    },
    Expire(PlayerId),
    Status,
    Save,
    Stop,
}

fn spawn_command_listener(bind_addr: SocketAddr) -> std::io::Result<Receiver<Command>> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;

    let (sender, receiver) = unbounded::<Command>();
    thread::spawn(move || loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("Command client connected: {}", addr);
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!("Command client {} left nonblocking: {}", addr, err);
                }
                let sender = sender.clone();
                thread::spawn(move || handle_client(stream, sender));
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                warn!("Error accepting command client: {}", err);
                thread::sleep(Duration::from_millis(200));
            }
        }
    });

    Ok(receiver)
}

fn handle_client(stream: TcpStream, sender: Sender<Command>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match parse_command(trimmed) {
                    Some(cmd) => {
                        if sender.send(cmd).is_err() {
                            break;
                        }
                    }
                    None => warn!("Invalid command: {}", trimmed),
                }
            }
            Err(err) => {
                warn!("Command read error: {}", err);
                break;
            }
        }
    }
}

fn parse_player(token: Option<&str>) -> Option<PlayerId> {
    token
        .and_then(|value| Uuid::parse_str(value).ok())
        .map(PlayerId)
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "op" => parse_player(parts.next()).map(Command::Op),
        "deop" => parse_player(parts.next()).map(Command::Deop),
        "expire" => parse_player(parts.next()).map(Command::Expire),
        "move" => {
            let player = parse_player(parts.next())?;
            let dimension = DimensionId::new(parts.next()?);
            let x = parts.next()?.parse::<i32>().ok()?;
            let z = parts.next()?.parse::<i32>().ok()?;
            Some(Command::Move {
                player,
                dimension,
                chunk: ChunkPos::new(x, z),
            })
        }
        "status" => Some(Command::Status),
        "save" => Some(Command::Save),
        "stop" => Some(Command::Stop),
        _ => None,
    }
}
