//! Producer/consumer bridge between a receive graph and the playback graph.
//!
//! ```text
//!  receive graph (peer N)              playback graph (shared)
//! +---------------------------+       +----------------------------------+
//! | ... decoder ! bridge-sink | ~~~~> | [bridge-source] ! mixer:sink_K   |
//! | ... decoder ! bridge-sink | ~~~~> | [bridge-source ! video-sink]     |
//! +---------------------------+       +----------------------------------+
//! ```
//!
//! Each playback-side half lives in its own bin attached to the playback
//! pipeline, so a peer's receive graph can be created, fail and be destroyed
//! without the shared pipeline ever changing state. Removing a peer
//! releases exactly its mixer input and detaches exactly its bins.

use crate::error::Result;
use crate::graph::{Endpoint, GraphBuilder, GraphId, GraphKind, GraphState, MediaEngine, NodeKind, NodeSpec, Prop};
use crate::media::Medium;
use crate::session::PeerId;
use crate::session::local::PlaybackGraph;

/// Receive-side half: the node decoded `medium` from peer `id` is pushed into.
pub fn sink_name(medium: Medium, id: PeerId) -> String {
    format!("recv-{medium}-bridge-{id}")
}

/// Playback-side half pulling from [`sink_name`].
pub fn source_name(medium: Medium, id: PeerId) -> String {
    format!("playback-{medium}-bridge-{id}")
}

/// Default renderer name when no custom video sink was supplied.
pub fn video_output_name(id: PeerId) -> String {
    format!("playback-video-output-{id}")
}

#[derive(Debug)]
struct AudioInput {
    bin: GraphId,
    mixer_input: String,
}

/// Playback-side resources of one peer.
#[derive(Debug)]
pub struct Bridge {
    peer: PeerId,
    audio: Option<AudioInput>,
    video: Option<GraphId>,
}

impl Bridge {
    /// Wire peer `peer`'s bridge sinks into playback.
    ///
    /// Audio goes to a newly requested mixer input. Video goes to
    /// `video_sink` when given, otherwise to a default video output.
    pub fn connect(
        engine: &mut dyn MediaEngine,
        playback: &PlaybackGraph,
        peer: PeerId,
        video_sink: Option<NodeSpec>,
    ) -> Result<Bridge> {
        let mut bridge = Bridge {
            peer,
            audio: None,
            video: None,
        };
        if let Err(e) = bridge.connect_inner(engine, playback, video_sink) {
            bridge.disconnect(engine, playback);
            return Err(e);
        }
        Ok(bridge)
    }

    fn connect_inner(
        &mut self,
        engine: &mut dyn MediaEngine,
        playback: &PlaybackGraph,
        video_sink: Option<NodeSpec>,
    ) -> Result<()> {
        let peer = self.peer;

        let audio_src = source_name(Medium::Audio, peer);
        let bin = engine.create_graph(&format!("playback-audio-{peer}"), GraphKind::Bin)?;
        let mixer_input = engine.request_endpoint(playback.mixer(), "sink_%u")?;
        self.audio = Some(AudioInput {
            bin,
            mixer_input: mixer_input.clone(),
        });
        GraphBuilder::new(engine, bin).add(
            NodeSpec::new(audio_src.as_str(), NodeKind::BridgeSource)
                .prop("proxysink", Prop::BridgePeer(sink_name(Medium::Audio, peer))),
        );
        engine.attach(playback.graph(), bin)?;
        GraphBuilder::new(engine, bin).link(
            Endpoint::src(audio_src.as_str()),
            Endpoint::new(playback.mixer(), mixer_input),
        );
        engine.set_state(bin, GraphState::Playing)?;

        let video_src = source_name(Medium::Video, peer);
        let bin = engine.create_graph(&format!("playback-video-{peer}"), GraphKind::Bin)?;
        self.video = Some(bin);
        GraphBuilder::new(engine, bin).add(
            NodeSpec::new(video_src.as_str(), NodeKind::BridgeSource)
                .prop("proxysink", Prop::BridgePeer(sink_name(Medium::Video, peer))),
        );
        // A caller-supplied sink may clash or refuse the link; that fails
        // this peer only.
        let sink_node = match video_sink {
            Some(sink) => {
                let name = sink.name.clone();
                engine.add_node(bin, sink)?;
                engine.link(&Endpoint::src(video_src.as_str()), &Endpoint::sink(name.as_str()))?;
                name
            }
            None => {
                let name = video_output_name(peer);
                GraphBuilder::new(engine, bin)
                    .add(NodeSpec::new(name.as_str(), NodeKind::VideoOutput))
                    .chain(&[video_src.as_str(), name.as_str()]);
                name
            }
        };
        engine.attach(playback.graph(), bin)?;
        engine.set_state(bin, GraphState::Playing)?;

        tracing::debug!(%peer, video_sink = %sink_node, "bridged into playback");
        Ok(())
    }

    /// Bins owned by this bridge inside the playback pipeline.
    pub fn graphs(&self) -> Vec<GraphId> {
        self.audio.iter().map(|a| a.bin).chain(self.video).collect()
    }

    pub fn mixer_input(&self) -> Option<&str> {
        self.audio.as_ref().map(|a| a.mixer_input.as_str())
    }

    /// Remove this peer's bins and release its mixer input. The playback
    /// pipeline and every other peer's bins are left untouched.
    pub fn disconnect(&mut self, engine: &mut dyn MediaEngine, playback: &PlaybackGraph) {
        let peer = self.peer;
        if let Some(audio) = self.audio.take() {
            remove_bin(engine, playback, audio.bin);
            if let Err(e) = engine.release_endpoint(playback.mixer(), &audio.mixer_input) {
                tracing::warn!(%peer, input = %audio.mixer_input, error = %e, "cannot release mixer input");
            }
        }
        if let Some(bin) = self.video.take() {
            remove_bin(engine, playback, bin);
        }
    }
}

fn remove_bin(engine: &mut dyn MediaEngine, playback: &PlaybackGraph, bin: GraphId) {
    if let Err(e) = engine.set_state(bin, GraphState::Null) {
        tracing::warn!(graph = %bin, error = %e, "cannot stop bin");
    }
    // A bin that never got attached has no parent to leave.
    let _ = engine.detach(playback.graph(), bin);
    if let Err(e) = engine.destroy_graph(bin) {
        tracing::warn!(graph = %bin, error = %e, "cannot destroy bin");
    }
}
