//! Chunk-boundary invariance of the response framing.
#![allow(dead_code)]

#[path = "../src/models.rs"]
mod models;

#[path = "../src/frame.rs"]
mod frame;

use frame::{Frame, FrameDecoder, encode_tool_call};
use models::ToolCallDescriptor;
use pretty_assertions::assert_eq;

/// Merge adjacent text frames; text granularity depends on chunking, the
/// ordered content does not.
fn normalize(frames: Vec<Frame>) -> Vec<Frame> {
    let mut out: Vec<Frame> = Vec::new();
    for frame in frames {
        match (out.last_mut(), frame) {
            (Some(Frame::Text(prev)), Frame::Text(next)) => prev.push_str(&next),
            (_, frame) => out.push(frame),
        }
    }
    out
}

fn decode_chunks(chunks: &[&[u8]]) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        frames.extend(decoder.push(chunk).expect("well-formed stream"));
    }
    frames.extend(decoder.finish().expect("stream ends on a frame boundary"));
    normalize(frames)
}

fn sample_stream() -> Vec<u8> {
    let mut wire = Vec::new();
    wire.extend_from_slice("Let me look around the room… ".as_bytes());
    wire.extend(
        encode_tool_call(&ToolCallDescriptor::function("call_a", "describe", "{}")).unwrap(),
    );
    wire.extend(
        encode_tool_call(&ToolCallDescriptor::function(
            "call_b",
            "click",
            r#"{"target":"door","note":"costs $5"}"#,
        ))
        .unwrap(),
    );
    wire.extend_from_slice("\nThe door is open. That cost $5 — worth it.\n".as_bytes());
    wire
}

#[test]
fn every_two_way_split_decodes_identically() {
    let wire = sample_stream();
    let expected = decode_chunks(&[&wire]);
    assert_eq!(expected.len(), 4);

    for split in 0..=wire.len() {
        let (head, tail) = wire.split_at(split);
        assert_eq!(decode_chunks(&[head, tail]), expected, "split at byte {split}");
    }
}

#[test]
fn byte_at_a_time_decodes_identically() {
    let wire = sample_stream();
    let expected = decode_chunks(&[&wire]);
    let chunks: Vec<&[u8]> = wire.chunks(1).collect();
    assert_eq!(decode_chunks(&chunks), expected);
}

#[test]
fn uneven_chunk_sizes_decode_identically() {
    let wire = sample_stream();
    let expected = decode_chunks(&[&wire]);
    for size in [2, 3, 5, 7, 11, 13, 64] {
        let chunks: Vec<&[u8]> = wire.chunks(size).collect();
        assert_eq!(decode_chunks(&chunks), expected, "chunk size {size}");
    }
}

#[test]
fn hello_world_arrives_as_three_text_frames() {
    let mut decoder = FrameDecoder::new();
    let mut texts = Vec::new();
    for chunk in ["Hello ", "wor", "ld"] {
        for frame in decoder.push(chunk.as_bytes()).unwrap() {
            match frame {
                Frame::Text(text) => texts.push(text),
                Frame::ToolCall(call) => panic!("unexpected tool call {call:?}"),
            }
        }
    }
    assert_eq!(texts.len(), 3);
    assert_eq!(texts.concat(), "Hello world");
}
