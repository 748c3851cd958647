use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

/// Reference to an on-disk asset (NAM profile or IR file).
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub path: String,
}

/// Immutable description of one chain element.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: String,
    pub node_type: String,
    pub category: String,
    pub enabled: bool,
    pub params: Map<String, Value>,
    pub asset: Option<AssetRef>,
}

impl NodeSpec {
    pub fn new(id: &str, node_type: &str, category: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            category: category.to_string(),
            enabled: true,
            params: Map::new(),
            asset: None,
        }
    }

    pub fn num_param(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(|v| v.as_f64())
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}

/// Ordered chain description, canonical version 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSpec {
    pub version: i64,
    pub sample_rate: u32,
    pub chain: Vec<NodeSpec>,
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self {
            version: 1,
            sample_rate: 48000,
            chain: Vec::new(),
        }
    }
}

fn get_string(obj: &Value, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => bail!("Field '{}' must be a string", key),
    }
}

fn parse_node(jn: &Value) -> Result<NodeSpec> {
    if !jn.is_object() {
        bail!("Each chain element must be an object");
    }

    let id = match get_string(jn, "id")? {
        Some(s) => s,
        None => bail!("Node missing required string field 'id'"),
    };
    let node_type = match get_string(jn, "type")? {
        Some(s) => s,
        None => bail!("Node missing required string field 'type'"),
    };

    let mut node = NodeSpec::new(&id, &node_type, "");
    if let Some(cat) = get_string(jn, "category")? {
        node.category = cat;
    }

    if let Some(en) = jn.get("enabled") {
        node.enabled = en
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("Node field 'enabled' must be a boolean"))?;
    }

    if let Some(params) = jn.get("params") {
        node.params = params
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("Node field 'params' must be an object"))?
            .clone();
    }

    if let Some(asset) = jn.get("asset") {
        if !asset.is_object() {
            bail!("Node field 'asset' must be an object");
        }
        let path = match asset.get("path").and_then(|p| p.as_str()) {
            Some(p) => p.to_string(),
            None => bail!("Node asset requires string field 'path'"),
        };
        node.asset = Some(AssetRef { path });
    }

    Ok(node)
}

fn parse_canonical_v1(j: &Value) -> Result<ChainSpec> {
    let version = match j.get("version").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => bail!("Missing/invalid 'version' (must be integer)"),
    };
    if version != 1 {
        bail!("Unsupported chain version");
    }

    let mut spec = ChainSpec {
        version,
        ..Default::default()
    };

    if let Some(sr) = j.get("sampleRate") {
        let sr = match sr.as_i64() {
            Some(v) => v,
            None => bail!("'sampleRate' must be integer"),
        };
        if sr <= 0 {
            bail!("'sampleRate' must be > 0");
        }
        spec.sample_rate = sr as u32;
    }

    let chain = match j.get("chain").and_then(|c| c.as_array()) {
        Some(arr) => arr,
        None => bail!("Missing/invalid 'chain' (must be array)"),
    };
    for jn in chain {
        spec.chain.push(parse_node(jn)?);
    }

    Ok(spec)
}

/// Legacy shape: `{audio:{inputTrimDb,sampleRate?}, chain:{namModelPath,irPath}, ...}`.
/// Rewritten to the canonical ordered list input → amp → cab → output.
fn parse_legacy(j: &Value) -> Result<ChainSpec> {
    let mut spec = ChainSpec::default();

    let audio = j.get("audio").filter(|a| a.is_object());
    if let Some(sr) = audio
        .and_then(|a| a.get("sampleRate"))
        .and_then(|v| v.as_i64())
    {
        spec.sample_rate = sr as u32;
    }

    let mut input = NodeSpec::new("input", "input", "utility");
    if let Some(trim) = audio.and_then(|a| a.get("inputTrimDb")) {
        if !trim.is_number() {
            bail!("legacy audio.inputTrimDb must be number");
        }
        input.params.insert("inputTrimDb".into(), trim.clone());
    }

    let mut amp = NodeSpec::new("amp1", "nam_model", "amp");
    let mut cab = NodeSpec::new("cab1", "ir_convolver", "cab");

    if let Some(chain) = j.get("chain").filter(|c| c.is_object()) {
        if let Some(p) = chain.get("namModelPath") {
            let path = p
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("legacy chain.namModelPath must be string"))?;
            amp.asset = Some(AssetRef { path: path.into() });
        }
        if let Some(p) = chain.get("irPath") {
            let path = p
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("legacy chain.irPath must be string"))?;
            cab.asset = Some(AssetRef { path: path.into() });
        }
    }

    let output = NodeSpec::new("output", "output", "utility");
    spec.chain = vec![input, amp, cab, output];
    Ok(spec)
}

/// Parse either the canonical v1 shape or the legacy shape.
pub fn parse_chain_value(j: &Value) -> Result<ChainSpec> {
    if !j.is_object() {
        bail!("Top-level JSON must be an object");
    }

    // Canonical carries a version plus an ordered chain array.
    if j.get("version").is_some() && j.get("chain").map(|c| c.is_array()).unwrap_or(false) {
        return parse_canonical_v1(j);
    }
    parse_legacy(j)
}

/// Enforce the v1 structural invariants on a parsed spec.
pub fn validate(spec: ChainSpec) -> Result<ChainSpec> {
    if spec.version != 1 {
        bail!("Only chain version 1 is supported");
    }
    if spec.chain.len() < 2 {
        bail!("Chain must contain at least input and output");
    }

    let mut seen = std::collections::HashSet::new();
    for n in &spec.chain {
        if n.id.is_empty() {
            bail!("Node id must be non-empty");
        }
        if !seen.insert(n.id.as_str()) {
            bail!("Duplicate node id: {}", n.id);
        }
        if n.node_type.is_empty() {
            bail!("Node type must be non-empty");
        }
    }

    if spec.chain.first().map(|n| n.node_type.as_str()) != Some("input") {
        bail!("First node must be type 'input'");
    }
    if spec.chain.last().map(|n| n.node_type.as_str()) != Some("output") {
        bail!("Last node must be type 'output'");
    }

    // v1 hard constraint: amp before cab, both present (bypass via `enabled`
    // is fine, reordering is not).
    let amp_idx = spec.chain.iter().position(|n| n.node_type == "nam_model");
    let cab_idx = spec.chain.iter().position(|n| n.node_type == "ir_convolver");
    let amp_idx = match amp_idx {
        Some(i) => i,
        None => bail!("Chain must contain a 'nam_model' node"),
    };
    let cab_idx = match cab_idx {
        Some(i) => i,
        None => bail!("Chain must contain an 'ir_convolver' node"),
    };
    if amp_idx >= cab_idx {
        bail!("Invalid ordering: 'nam_model' must appear before 'ir_convolver'");
    }

    Ok(spec)
}

/// Serialize back to the canonical v1 form used for persistence and
/// `get_chain` responses.
pub fn to_json(spec: &ChainSpec) -> Value {
    let chain: Vec<Value> = spec
        .chain
        .iter()
        .map(|n| {
            let mut jn = Map::new();
            jn.insert("id".into(), json!(n.id));
            jn.insert("type".into(), json!(n.node_type));
            if !n.category.is_empty() {
                jn.insert("category".into(), json!(n.category));
            }
            jn.insert("enabled".into(), json!(n.enabled));
            jn.insert("params".into(), Value::Object(n.params.clone()));
            if let Some(asset) = &n.asset {
                jn.insert("asset".into(), json!({"path": asset.path}));
            }
            Value::Object(jn)
        })
        .collect();

    json!({
        "version": spec.version,
        "sampleRate": spec.sample_rate,
        "chain": chain,
    })
}
