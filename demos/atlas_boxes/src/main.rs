// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Atlas boxes
//!
//! Packs a list of boxes into an atlas and prints where each one landed.
//! Run with `RUST_LOG=trace` to follow every cut and merge.

use anyhow::{bail, Context, Result};
use clap::Parser;
use vello_atlas::{Allocator, AllocatorOptions, Size};

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let canvas = Size::new(args.width, args.height);
    let options = AllocatorOptions {
        allow_transpose: !args.no_transpose,
    };
    let mut atlas = Allocator::try_with_options(canvas, options)
        .with_context(|| format!("Creating a {canvas} atlas"))?;

    let boxes = if args.boxes.is_empty() {
        default_boxes()
    } else {
        args.boxes.clone()
    };

    let mut placed = Vec::new();
    for size in boxes {
        let allocation = atlas.allocate(size);
        if allocation.is_null() {
            log::warn!("failed to allocate space for {size}");
            continue;
        }
        println!(
            "{size} -> {}{}",
            allocation.rect,
            if allocation.transposed {
                " (transposed)"
            } else {
                ""
            }
        );
        placed.push(allocation.id);
    }

    let used = atlas.allocated_area();
    let total = canvas.area();
    println!(
        "Placed {} boxes, {used} of {total} pixels in use ({:.1}%)",
        placed.len(),
        used as f64 * 100.0 / total as f64
    );

    if args.release {
        for id in placed.into_iter().rev() {
            atlas.deallocate(id)?;
        }
        atlas.validate().context("Atlas is inconsistent after release")?;
        if !atlas.is_empty() {
            bail!("Atlas still holds allocations after releasing all of them");
        }
        println!("Released everything, {} node left", atlas.node_count());
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(about, long_about = None, bin_name = "cargo run -p atlas_boxes --")]
struct Args {
    /// The width of the atlas.
    #[arg(long, default_value_t = 800)]
    width: u32,
    /// The height of the atlas.
    #[arg(long, default_value_t = 800)]
    height: u32,
    /// A box to place, as `WIDTHxHEIGHT`. Can be repeated.
    #[arg(long = "box", value_parser = parse_size)]
    boxes: Vec<Size>,
    /// Never rotate boxes to make them fit.
    #[arg(long)]
    no_transpose: bool,
    /// Release every box again afterwards and check that the atlas is empty.
    #[arg(long)]
    release: bool,
}

fn default_boxes() -> Vec<Size> {
    vec![
        Size::new(100, 40),
        Size::new(60, 300),
        Size::new(250, 270),
        Size::new(300, 20),
    ]
}

fn parse_size(val: &str) -> Result<Size, String> {
    let (width, height) = val
        .split_once('x')
        .ok_or_else(|| format!("'{val}' is not of the form WIDTHxHEIGHT"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .map_err(|_| "Width must be a positive integer".to_string())?;
    let height = height
        .trim()
        .parse::<u32>()
        .map_err(|_| "Height must be a positive integer".to_string())?;
    Ok(Size::new(width, height))
}
