//! concord-sim: runs a host and several participants over a jittery
//! in-memory network, drives random concurrent edits, and checks that every
//! site ends up with the same document.

mod network;

use anyhow::{bail, Context, Result};
use clap::Parser;
use concord::{
    spawn_session, CollabConfig, DocumentId, DocumentState, HostSession, MemoryEditor,
    ParticipantId, ParticipantSession, SessionEvent, SessionHandle, SessionId,
};
use network::Network;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use text_ot::Operation;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DOCUMENT: &str = "doc";
const ALPHABET: &[char] = &['a', 'b', 'c', 'd', 'e', ' ', 'é', '中'];

#[derive(Parser, Debug)]
#[command(name = "concord-sim")]
#[command(about = "Check convergence of concurrent edits over a reordering network")]
#[command(version)]
struct Args {
    /// Participants besides the host
    #[arg(short, long, default_value_t = 3)]
    participants: usize,

    /// Edits to make, spread randomly over all sites
    #[arg(short, long, default_value_t = 200)]
    edits: usize,

    /// Random seed (drawn from entropy if omitted)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Upper bound of the random delay added to each packet
    #[arg(long, default_value_t = 20)]
    max_delay_ms: u64,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Initial document content
    #[arg(long, default_value = "hello world")]
    initial: String,

    /// Give up if the network has not settled after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

type Host = SessionHandle<HostSession, MemoryEditor>;
type Peer = SessionHandle<ParticipantSession, MemoryEditor>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CollabConfig::load(path),
        None => CollabConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    info!(
        seed,
        participants = args.participants,
        edits = args.edits,
        max_delay_ms = args.max_delay_ms,
        "starting simulation"
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let network = Network::new(StdRng::seed_from_u64(seed.wrapping_add(1)), args.max_delay_ms);
    let inconsistencies = Arc::new(AtomicUsize::new(0));
    let session = SessionId::generate();
    let document = DocumentId::from(DOCUMENT);
    let host_id = ParticipantId::from("host");

    let mut host_session = HostSession::new(session.clone(), host_id.clone(), config.clone());
    host_session
        .share_document(document.clone(), args.initial.as_str(), 0)
        .context("sharing document")?;
    let (host, events, host_task) = spawn_session(
        host_session,
        MemoryEditor::new().with_document(document.clone(), args.initial.as_str()),
        network.transport(host_id.clone()),
        &config,
    );
    watch_events(host_id.clone(), events, Arc::clone(&inconsistencies));
    let inbox = host.clone();
    network.register(
        host_id.clone(),
        Box::new(move |from, packet| inbox.deliver(from, packet).is_ok()),
    );

    let mut peers: Vec<(ParticipantId, Peer)> = Vec::new();
    for i in 1..=args.participants {
        let id = ParticipantId::new(format!("peer-{i}"));
        let participant = ParticipantSession::new(session.clone(), id.clone(), host_id.clone(), config.clone());
        let (handle, events, _task) =
            spawn_session(participant, MemoryEditor::new(), network.transport(id.clone()), &config);
        watch_events(id.clone(), events, Arc::clone(&inconsistencies));
        let inbox = handle.clone();
        network.register(
            id.clone(),
            Box::new(move |from, packet| inbox.deliver(from, packet).is_ok()),
        );
        peers.push((id, handle));
    }

    for (id, _) in &peers {
        let id = id.clone();
        host.exec(move |session: &mut HostSession, _, now| session.add_participant(id, now))?;
    }

    let limit = Duration::from_secs(args.timeout_secs);
    timeout(limit, wait_until_joined(&peers, &document))
        .await
        .context("participants did not receive the document in time")??;
    info!("all participants joined");

    let mut applied = 0usize;
    for _ in 0..args.edits {
        let site = rng.gen_range(0..=peers.len());
        let edit = RandomEdit::generate(&mut rng);
        let result = match site {
            0 => host.edit(document.clone(), move |c| edit.resolve(c)).await,
            i => peers[i - 1].1.edit(document.clone(), move |c| edit.resolve(c)).await,
        };
        match result {
            Ok(Some(_)) => applied += 1,
            Ok(None) => {}
            Err(e) => warn!(site, error = %e, "edit refused"),
        }
        let pause = rng.gen_range(0..=args.max_delay_ms / 4);
        if pause > 0 {
            sleep(Duration::from_millis(pause)).await;
        }
    }
    info!(applied, "edits done, waiting for the network to settle");

    let contents = timeout(limit, settle(&network, &host, &peers, &document))
        .await
        .context("network did not settle in time")??;

    let host_content = contents.first().and_then(|(_, c)| c.clone());
    let mut diverged = 0;
    for (id, content) in &contents {
        if *content != host_content {
            diverged += 1;
            error!(site = %id, content = ?content, expected = ?host_content, "site diverged");
        }
    }

    host.shutdown()?;
    for (_, peer) in &peers {
        peer.shutdown()?;
    }
    let (host_session, _) = host_task.await.context("host task failed")?;

    info!(
        delivered = network.delivered(),
        inconsistencies = inconsistencies.load(Ordering::SeqCst),
        resyncs = host_session.watchdog().detected(),
        length = host_content.as_deref().map_or(0, |c| c.chars().count()),
        "simulation finished"
    );
    if diverged > 0 {
        bail!("{diverged} of {} sites diverged (seed {seed})", contents.len());
    }
    println!("converged: {} sites, seed {seed}", contents.len());
    Ok(())
}

/// Log every non-transmit event of one site.
fn watch_events(site: ParticipantId, mut events: UnboundedReceiver<SessionEvent>, inconsistencies: Arc<AtomicUsize>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::InconsistencyDetected { document, peer, reason } => {
                    inconsistencies.fetch_add(1, Ordering::SeqCst);
                    warn!(%site, %document, %peer, %reason, "inconsistency");
                }
                SessionEvent::DocumentBroken { document, reason } => {
                    error!(%site, %document, %reason, "document broken");
                }
                other => debug!(%site, event = ?other, "event"),
            }
        }
    });
}

async fn wait_until_joined(peers: &[(ParticipantId, Peer)], document: &DocumentId) -> Result<()> {
    for (_, peer) in peers {
        loop {
            let doc = document.clone();
            let state = peer
                .query(move |s: &ParticipantSession, _| s.document_state(&doc))
                .await?;
            if state == Some(DocumentState::Active) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
    Ok(())
}

/// Wait until no packet is in flight across a full round of queries, then
/// return every site's copy of the document, host first.
async fn settle(
    network: &Network,
    host: &Host,
    peers: &[(ParticipantId, Peer)],
    document: &DocumentId,
) -> Result<Vec<(ParticipantId, Option<String>)>> {
    loop {
        while network.in_flight() > 0 {
            sleep(Duration::from_millis(20)).await;
        }

        let mut contents = Vec::with_capacity(peers.len() + 1);
        let doc = document.clone();
        let host_content = host
            .query(move |_, editor: &MemoryEditor| editor.get(&doc).map(str::to_string))
            .await?;
        contents.push((ParticipantId::from("host"), host_content));
        for (id, peer) in peers {
            let doc = document.clone();
            let content = peer
                .query(move |_, editor: &MemoryEditor| editor.get(&doc).map(str::to_string))
                .await?;
            contents.push((id.clone(), content));
        }

        // The queries queue behind every delivery made so far; anything those
        // deliveries sent shows up here.
        if network.in_flight() == 0 {
            return Ok(contents);
        }
    }
}

/// Random edit parameters, resolved against the content at edit time.
#[derive(Debug, Clone)]
struct RandomEdit {
    insert: bool,
    position: usize,
    length: usize,
    text: String,
}

impl RandomEdit {
    fn generate(rng: &mut StdRng) -> Self {
        let len = rng.gen_range(1..=4);
        Self {
            insert: rng.gen_bool(0.6),
            position: rng.gen(),
            length: rng.gen_range(1..=6),
            text: (0..len)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())])
                .collect(),
        }
    }

    fn resolve(self, content: &str) -> Option<Operation> {
        let chars = content.chars().count();
        let position = self.position % (chars + 1);
        if self.insert || position == chars {
            return Some(Operation::insert(position, self.text));
        }
        let count = self.length.min(chars - position);
        let removed: String = content.chars().skip(position).take(count).collect();
        Some(Operation::delete(position, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_clamps_to_content() {
        let edit = RandomEdit {
            insert: false,
            position: 13,
            length: 10,
            text: String::new(),
        };
        // 13 % 6 == 1, and only four characters follow.
        assert_eq!(edit.resolve("héllo"), Some(Operation::delete(1, "éllo")));

        let insert = RandomEdit {
            insert: true,
            position: 7,
            length: 1,
            text: "x".into(),
        };
        assert_eq!(insert.resolve(""), Some(Operation::insert(0, "x")));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["concord-sim", "-p", "5", "--seed", "7", "--max-delay-ms", "0"]);
        assert_eq!(args.participants, 5);
        assert_eq!(args.seed, Some(7));
        assert_eq!(args.max_delay_ms, 0);
        assert_eq!(args.edits, 200);
    }
}
