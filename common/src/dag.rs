use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::ids::{ChannelId, JobId, VertexId};

/// Unidad de entrada que reparte el coordinador (`get_next_input_split`).
/// El payload es opaco para el runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSplit {
    pub number: u32,
    pub payload: Value,
}

/// Vértice del grafo: se convierte en exactamente una tarea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVertex {
    pub id: VertexId,
    pub name: String,

    /// Nombre de la unidad ejecutable; se resuelve contra el registro
    /// de invokables del worker al desplegar.
    pub invokable: String,

    #[serde(default)]
    pub config: Value,

    /// Páginas de memoria que la tarea reserva durante toda su vida.
    #[serde(default)]
    pub memory_pages: usize,

    /// Splits de entrada explícitos para este vértice.
    #[serde(default)]
    pub splits: Vec<InputSplit>,

    /// Patrón de archivos, ej: `/data/input/*.txt`. El coordinador genera
    /// un split `{"path": ...}` por cada archivo que haga match.
    #[serde(default)]
    pub input_glob: Option<String>,
}

impl JobVertex {
    pub fn new(name: impl Into<String>, invokable: impl Into<String>) -> Self {
        Self {
            id: VertexId::new(),
            name: name.into(),
            invokable: invokable.into(),
            config: Value::Null,
            memory_pages: 0,
            splits: Vec::new(),
            input_glob: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_memory_pages(mut self, pages: usize) -> Self {
        self.memory_pages = pages;
        self
    }

    pub fn with_splits(mut self, splits: Vec<InputSplit>) -> Self {
        self.splits = splits;
        self
    }

    pub fn with_input_glob(mut self, pattern: impl Into<String>) -> Self {
        self.input_glob = Some(pattern.into());
        self
    }
}

/// Canal de datos dirigido entre dos vértices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEdge {
    pub channel_id: ChannelId,
    pub source: VertexId,
    pub target: VertexId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGraph {
    #[serde(default)]
    pub job_id: JobId,
    pub name: String,

    /// Config del job que viaja con cada tarea (ej: `"profile": false`).
    #[serde(default)]
    pub config: Value,

    pub vertices: Vec<JobVertex>,

    #[serde(default)]
    pub edges: Vec<JobEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("el grafo no tiene vértices")]
    Empty,
    #[error("vértice duplicado {0}")]
    DuplicateVertex(VertexId),
    #[error("el vértice {0} no tiene invokable")]
    MissingInvokable(VertexId),
    #[error("la arista {channel} referencia un vértice desconocido {vertex}")]
    UnknownVertex { channel: ChannelId, vertex: VertexId },
    #[error("la arista {0} conecta un vértice consigo mismo")]
    SelfLoop(ChannelId),
    #[error("canal duplicado {0}")]
    DuplicateChannel(ChannelId),
    #[error("el grafo tiene un ciclo")]
    Cycle,
}

impl JobGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            name: name.into(),
            config: Value::Null,
            vertices: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Agrega un vértice y devuelve su id.
    pub fn add_vertex(&mut self, vertex: JobVertex) -> VertexId {
        let id = vertex.id.clone();
        self.vertices.push(vertex);
        id
    }

    /// Conecta `source` con `target` usando un canal nuevo.
    pub fn connect(&mut self, source: &VertexId, target: &VertexId) -> ChannelId {
        let channel_id = ChannelId::new();
        self.edges.push(JobEdge {
            channel_id: channel_id.clone(),
            source: source.clone(),
            target: target.clone(),
        });
        channel_id
    }

    pub fn vertex(&self, id: &VertexId) -> Option<&JobVertex> {
        self.vertices.iter().find(|v| &v.id == id)
    }

    /// Aristas que entran a `id`, en orden de declaración (orden de gates).
    pub fn inputs_of<'a>(&'a self, id: &'a VertexId) -> impl Iterator<Item = &'a JobEdge> + 'a {
        self.edges.iter().filter(move |e| &e.target == id)
    }

    /// Aristas que salen de `id`, en orden de declaración (orden de gates).
    pub fn outputs_of<'a>(&'a self, id: &'a VertexId) -> impl Iterator<Item = &'a JobEdge> + 'a {
        self.edges.iter().filter(move |e| &e.source == id)
    }

    /// Chequeos estructurales mínimos que el runtime necesita
    /// (el planner ya entrega grafos válidos).
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.vertices.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut ids = HashSet::new();
        for v in &self.vertices {
            if !ids.insert(&v.id) {
                return Err(GraphError::DuplicateVertex(v.id.clone()));
            }
            if v.invokable.trim().is_empty() {
                return Err(GraphError::MissingInvokable(v.id.clone()));
            }
        }

        let mut channels = HashSet::new();
        for e in &self.edges {
            if !channels.insert(&e.channel_id) {
                return Err(GraphError::DuplicateChannel(e.channel_id.clone()));
            }
            for endpoint in [&e.source, &e.target] {
                if !ids.contains(endpoint) {
                    return Err(GraphError::UnknownVertex {
                        channel: e.channel_id.clone(),
                        vertex: endpoint.clone(),
                    });
                }
            }
            if e.source == e.target {
                return Err(GraphError::SelfLoop(e.channel_id.clone()));
            }
        }

        // Kahn: todos los vértices tienen que salir en orden topológico
        let mut in_degree: HashMap<&VertexId, usize> =
            self.vertices.iter().map(|v| (&v.id, 0)).collect();
        for e in &self.edges {
            *in_degree.entry(&e.target).or_insert(0) += 1;
        }

        let mut ready: VecDeque<&VertexId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = ready.pop_front() {
            visited += 1;
            for e in self.edges.iter().filter(|e| &e.source == id) {
                if let Some(d) = in_degree.get_mut(&e.target) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(&e.target);
                    }
                }
            }
        }

        if visited != self.vertices.len() {
            return Err(GraphError::Cycle);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source_sink() -> (JobGraph, VertexId, VertexId) {
        let mut g = JobGraph::new("pipeline");
        let src = g.add_vertex(JobVertex::new("source", "sequence_source"));
        let sink = g.add_vertex(JobVertex::new("sink", "discard_sink"));
        g.connect(&src, &sink);
        (g, src, sink)
    }

    #[test]
    fn valid_pipeline_passes() {
        let (g, src, sink) = source_sink();
        assert_eq!(g.validate(), Ok(()));
        assert_eq!(g.outputs_of(&src).count(), 1);
        assert_eq!(g.inputs_of(&sink).count(), 1);
        assert_eq!(g.inputs_of(&src).count(), 0);
    }

    #[test]
    fn empty_graph_is_rejected() {
        assert_eq!(JobGraph::new("empty").validate(), Err(GraphError::Empty));
    }

    #[test]
    fn cycle_is_rejected() {
        let (mut g, src, sink) = source_sink();
        g.connect(&sink, &src);
        assert_eq!(g.validate(), Err(GraphError::Cycle));
    }

    #[test]
    fn self_loop_is_rejected() {
        let (mut g, src, _) = source_sink();
        let ch = g.connect(&src, &src);
        assert_eq!(g.validate(), Err(GraphError::SelfLoop(ch)));
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let (mut g, src, _) = source_sink();
        let ghost = VertexId::from("ghost");
        g.connect(&src, &ghost);
        assert!(matches!(
            g.validate(),
            Err(GraphError::UnknownVertex { vertex, .. }) if vertex == ghost
        ));
    }

    #[test]
    fn missing_invokable_is_rejected() {
        let mut g = JobGraph::new("bad");
        let id = g.add_vertex(JobVertex::new("v", "  "));
        assert_eq!(g.validate(), Err(GraphError::MissingInvokable(id)));
    }

    #[test]
    fn graph_round_trips_through_json_with_defaults() {
        let raw = json!({
            "name": "from-file",
            "vertices": [
                {"id": "a", "name": "a", "invokable": "sequence_source", "config": {"count": 3}},
                {"id": "b", "name": "b", "invokable": "discard_sink"}
            ],
            "edges": [{"channel_id": "c", "source": "a", "target": "b"}]
        });

        let g: JobGraph = serde_json::from_value(raw).unwrap();
        assert_eq!(g.validate(), Ok(()));
        assert_eq!(g.vertices[1].memory_pages, 0);
        assert!(g.vertices[1].splits.is_empty());
        assert!(!g.job_id.as_str().is_empty());
    }
}
