//! ASR wire protocol: frame types and the length-prefixed codec

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, CodecError, Decoded, Frame, FrameAssembler, MAX_FRAME_LEN};
pub use frames::{
    ApiParam, ApiThirdData, AsrResult, RequestFrame, RequestType, ResponseFrame, ResponseKind,
    ResponseType,
};

/// Upload sequence for the streaming endpoint: AUTH, audio blocks, LAST
pub fn upload_plan(auth: ApiParam, audio: &[u8], block_size: usize) -> Vec<RequestFrame> {
    let mut plan = Vec::with_capacity(audio.len() / block_size.max(1) + 3);
    plan.push(RequestFrame::Auth(auth));
    plan.extend(RequestFrame::data_blocks(audio, block_size));
    plan.push(RequestFrame::Last);
    plan
}

/// Sequence for the one-shot activation endpoint: PARAM, audio blocks, LAST
pub fn activation_plan(param: ApiParam, audio: &[u8], block_size: usize) -> Vec<RequestFrame> {
    let mut plan = Vec::with_capacity(audio.len() / block_size.max(1) + 3);
    plan.push(RequestFrame::Param(param));
    plan.extend(RequestFrame::data_blocks(audio, block_size));
    plan.push(RequestFrame::Last);
    plan
}
