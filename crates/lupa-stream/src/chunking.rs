use base64::Engine;

use crate::events::StreamEvent;

pub const DEFAULT_TEXT_CHUNK_WORDS: usize = 5;
pub const DEFAULT_AUDIO_CHUNK_BYTES: usize = 4096;

/// Groups text into word chunks to bound per-chunk overhead. Whitespace
/// between words collapses to single spaces; empty input yields no chunks.
pub fn chunk_text_by_words(text: &str, words_per_chunk: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    words
        .chunks(words_per_chunk.max(1))
        .map(|chunk| chunk.join(" "))
        .collect()
}

/// Splits raw audio into base64-encoded events of `chunk_bytes` each; the
/// last chunk carries `final: true`. Empty audio yields a single final
/// empty chunk so the client always sees the terminator.
pub fn chunk_audio(audio: &[u8], chunk_bytes: usize) -> Vec<StreamEvent> {
    let engine = base64::engine::general_purpose::STANDARD;
    if audio.is_empty() {
        return vec![StreamEvent::Audio {
            data: String::new(),
            index: 0,
            final_chunk: true,
        }];
    }
    let chunks: Vec<&[u8]> = audio.chunks(chunk_bytes.max(1)).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| StreamEvent::Audio {
            data: engine.encode(chunk),
            index,
            final_chunk: index == last,
        })
        .collect()
}
