// Flow generator
//
// Builds ComfyUI node graphs in the API format. Each node added to the flow hands back
// its outputs as a NodeResult of links, and downstream nodes pick their inputs out of
// that with get_value_at_index. So a wiring mistake is an error here, not a 400 from
// the server.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use crate::{
    config::WorkflowParams,
    outputs::{get_value_at_index, NodeResult},
};

/// Reference to output `slot` of node `node`. Serialized the way ComfyUI wants it: `["4", 0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub node: String,
    pub slot: usize,
}

impl Link {
    fn to_json(&self) -> Value {
        json!([self.node, self.slot])
    }
}

/// What a node class returns.
#[derive(Debug, Clone, Copy)]
pub enum OutputShape {
    /// A plain tuple of `n` outputs.
    Plain(usize),
    /// Output nodes answer with a UI payload, and wrap any real outputs under "result".
    Wrapped(usize),
}

#[derive(Debug, Clone)]
struct Node {
    class_type: String,
    inputs: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct Flow {
    nodes: BTreeMap<String, Node>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. `inputs` must be a JSON object; use `link()` for connections.
    pub fn add(
        &mut self,
        id: &str,
        class_type: &str,
        inputs: Value,
        shape: OutputShape,
    ) -> Result<NodeResult<Link>> {
        let Value::Object(inputs) = inputs else {
            bail!("inputs for {} ({}) must be an object", id, class_type);
        };
        if self.nodes.contains_key(id) {
            bail!("duplicate node id {}", id);
        }
        self.nodes.insert(
            id.to_string(),
            Node {
                class_type: class_type.to_string(),
                inputs,
            },
        );
        let links = |n: usize| {
            (0..n)
                .map(|slot| Link {
                    node: id.to_string(),
                    slot,
                })
                .collect::<Vec<_>>()
        };
        Ok(match shape {
            OutputShape::Plain(n) => NodeResult::Sequence(links(n)),
            OutputShape::Wrapped(n) => NodeResult::wrapped(links(n)),
        })
    }

    /// The graph as the `prompt` field of a /prompt request.
    pub fn to_prompt(&self) -> Value {
        Value::Object(
            self.nodes
                .iter()
                .map(|(id, node)| {
                    (
                        id.clone(),
                        json!({
                            "class_type": node.class_type,
                            "inputs": node.inputs,
                        }),
                    )
                })
                .collect(),
        )
    }

    /// Every node class this flow needs the server to know about.
    pub fn class_types(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.class_type.as_str()).collect()
    }
}

/// Picks output `index` of an upstream node, as an input value.
pub fn link(outputs: &NodeResult<Link>, index: usize) -> Result<Value> {
    let link = get_value_at_index(outputs, index)
        .with_context(|| format!("failed to wire output {}", index))?;
    Ok(link.to_json())
}

fn on_off(on: bool) -> &'static str {
    if on { "On" } else { "Off" }
}

fn enable(on: bool) -> &'static str {
    if on { "enable" } else { "disable" }
}

/// Builds the full txt2img graph:
/// checkpoint -> DeepCache -> FreeU -> LoRA stack -> sampler -> VAE decode -> save.
pub fn build_workflow(params: &WorkflowParams, seed: u64) -> Result<Flow> {
    let mut flow = Flow::new();

    let checkpoint = flow.add(
        "4",
        "CheckpointLoaderSimple",
        json!({ "ckpt_name": params.checkpoint }),
        OutputShape::Plain(3),
    )?;

    let dc = &params.deep_cache;
    let deep_cache = flow.add(
        "109",
        "DeepCache",
        json!({
            "cache_interval": dc.cache_interval,
            "cache_depth": dc.cache_depth,
            "start_step": dc.start_step,
            "end_step": dc.end_step,
            "model": link(&checkpoint, 0)?,
        }),
        OutputShape::Plain(1),
    )?;

    let fu = &params.freeu;
    let freeu = flow.add(
        "92",
        "FreeU_V2",
        json!({
            "b1": fu.b1,
            "b2": fu.b2,
            "s1": fu.s1,
            "s2": fu.s2,
            "model": link(&deep_cache, 0)?,
        }),
        OutputShape::Plain(1),
    )?;

    let mut lora_inputs = json!({
        "model": link(&freeu, 0)?,
        "clip": link(&checkpoint, 1)?,
    });
    for (i, slot) in params.loras.iter().enumerate() {
        let n = i + 1;
        lora_inputs[format!("switch_{n}")] = json!(on_off(slot.enabled));
        lora_inputs[format!("lora_name_{n}")] = json!(slot.name);
        lora_inputs[format!("strength_model_{n}")] = json!(slot.strength_model);
        lora_inputs[format!("strength_clip_{n}")] = json!(slot.strength_clip);
    }
    let loras = flow.add("55", "LoraStackLoader_PoP", lora_inputs, OutputShape::Plain(2))?;

    let ar = &params.aspect;
    let aspect = flow.add(
        "100",
        "CR Aspect Ratio",
        json!({
            "width": ar.width,
            "height": ar.height,
            "aspect_ratio": ar.aspect_ratio,
            "swap_dimensions": on_off(ar.swap_dimensions),
            "upscale_factor": ar.upscale_factor,
            "prescale_factor": ar.prescale_factor,
            "batch_size": ar.batch_size,
        }),
        // width, height, upscale, prescale, batch size, latent, help text
        OutputShape::Plain(7),
    )?;

    let positive = flow.add(
        "102",
        "CLIPTextEncode",
        json!({ "text": params.positive, "clip": link(&loras, 1)? }),
        OutputShape::Plain(1),
    )?;
    let negative = flow.add(
        "105",
        "CLIPTextEncode",
        json!({ "text": params.negative, "clip": link(&loras, 1)? }),
        OutputShape::Plain(1),
    )?;

    let s = &params.sampler;
    let sampled = flow.add(
        "65",
        "KSamplerAdvanced",
        json!({
            "add_noise": enable(s.add_noise),
            "noise_seed": seed,
            "steps": s.steps,
            "cfg": s.cfg,
            "sampler_name": s.sampler_name,
            "scheduler": s.scheduler,
            "start_at_step": s.start_at_step,
            "end_at_step": s.end_at_step,
            "return_with_leftover_noise": enable(s.return_with_leftover_noise),
            "model": link(&loras, 0)?,
            "positive": link(&positive, 0)?,
            "negative": link(&negative, 0)?,
            "latent_image": link(&aspect, 5)?,
        }),
        OutputShape::Plain(1),
    )?;

    let decoded = flow.add(
        "45",
        "VAEDecode",
        json!({
            "samples": link(&sampled, 0)?,
            "vae": link(&checkpoint, 2)?,
        }),
        OutputShape::Plain(1),
    )?;

    flow.add(
        "114",
        "SaveImage",
        json!({
            "filename_prefix": params.filename_prefix,
            "images": link(&decoded, 0)?,
        }),
        OutputShape::Wrapped(0),
    )?;

    Ok(flow)
}
