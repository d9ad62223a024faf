// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipestep contributors

//! Graph command - visualize pipeline as a graph

use miette::Result;
use std::path::PathBuf;

use super::GraphFormat;
use crate::pipeline::{DagBuilder, PipelineSpec};

/// Run the graph command
pub async fn run(spec_path: PathBuf, format: GraphFormat, _verbose: bool) -> Result<()> {
    let spec = PipelineSpec::from_file(&spec_path)?;
    let dag = DagBuilder::build(&spec)?;

    let output = match format {
        GraphFormat::Text => dag.to_text(&spec)?,
        GraphFormat::Dot => dag.to_dot(),
        GraphFormat::Mermaid => dag.to_mermaid(),
    };

    println!("{}", output);

    Ok(())
}
