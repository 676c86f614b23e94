//! Minimal RIFF/WAVE container for 16-bit mono PCM.
//!
//! ```text
//! offset  size  field
//!      0     4  "RIFF"
//!      4     4  36 + N
//!      8     4  "WAVE"
//!     12     4  "fmt "
//!     16     4  16            (fmt chunk size)
//!     20     2  1             (PCM)
//!     22     2  1             (mono)
//!     24     4  sample rate
//!     28     4  byte rate     (rate * 2)
//!     32     2  block align   (2)
//!     34     2  16            (bits per sample)
//!     36     4  "data"
//!     40     4  N
//! ```

use byteorder::{ByteOrder, LittleEndian};

pub const WAV_HEADER_LEN: usize = 44;

const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const BLOCK_ALIGN: u16 = CHANNELS * BITS_PER_SAMPLE / 8;

/// Build the 44-byte header for `data_len` bytes of PCM.
pub fn header(data_len: u32, sample_rate: u32) -> [u8; WAV_HEADER_LEN] {
    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut header[4..8], 36 + data_len);
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], 16);
    LittleEndian::write_u16(&mut header[20..22], 1);
    LittleEndian::write_u16(&mut header[22..24], CHANNELS);
    LittleEndian::write_u32(&mut header[24..28], sample_rate);
    LittleEndian::write_u32(&mut header[28..32], sample_rate * u32::from(BLOCK_ALIGN));
    LittleEndian::write_u16(&mut header[32..34], BLOCK_ALIGN);
    LittleEndian::write_u16(&mut header[34..36], BITS_PER_SAMPLE);
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], data_len);
    header
}

/// Prefix little-endian PCM bytes with a WAV header.
pub fn wrap_pcm16_mono(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(&header(pcm.len() as u32, sample_rate));
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_sizes() {
        let pcm = vec![0u8; 960];
        let wav = wrap_pcm16_mono(&pcm, 24000);
        assert_eq!(wav.len(), pcm.len() + WAV_HEADER_LEN);
        assert_eq!(LittleEndian::read_u32(&wav[4..8]), 36 + 960);
        assert_eq!(LittleEndian::read_u32(&wav[40..44]), 960);
        assert_eq!(&wav[36..40], b"data");
    }

    #[test]
    fn test_readable_by_wav_decoder() {
        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        let mut pcm = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(&samples, &mut pcm);

        let wav = wrap_pcm16_mono(&pcm, 24000);
        let (header, data) = wav::read(&mut Cursor::new(wav)).unwrap();

        assert_eq!(header.audio_format, 1);
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.sampling_rate, 24000);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(data.as_sixteen(), Some(&samples));
    }

    #[test]
    fn test_empty_payload() {
        let wav = wrap_pcm16_mono(&[], 16000);
        assert_eq!(wav.len(), WAV_HEADER_LEN);
        assert_eq!(LittleEndian::read_u32(&wav[4..8]), 36);
        assert_eq!(LittleEndian::read_u32(&wav[28..32]), 32000);
    }
}
