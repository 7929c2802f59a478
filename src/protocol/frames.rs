//! ASR frame types
//!
//! Two layers live here:
//!
//! - `Api*` structs are the protobuf bodies carried inside each
//!   length-prefixed record on the wire.
//! - `RequestFrame` / `ResponseFrame` are the tagged unions the relay works
//!   with. Conversions between the two layers reject bodies whose tag is
//!   unknown or whose tag demands a payload that is missing.

use bytes::Bytes;
use prost::Message;

use super::codec::{CodecError, Frame};

/// Request body tag (`ApiRequest.api_req_type`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    Unspecified = 0,
    Param = 1,
    Data = 2,
    ThirdData = 3,
    Last = 4,
    Cancel = 5,
    Auth = 6,
}

/// Response body tag (`ApiResponse.resp_type`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseType {
    Unspecified = 0,
    Middle = 1,
    Res = 2,
    Third = 3,
    Heart = 4,
    Last = 5,
}

/// Authentication / activation parameters.
///
/// The contents (cuid, keys, the encrypted `pam` document) are produced by the
/// session-setup layer; the relay only carries them.
#[derive(Clone, PartialEq, Message)]
pub struct ApiParam {
    #[prost(string, tag = "1")]
    pub cuid: String,
    #[prost(string, tag = "2")]
    pub chunk_key: String,
    #[prost(int32, tag = "3")]
    pub sample_rate: i32,
    #[prost(string, tag = "4")]
    pub format: String,
    #[prost(int64, tag = "5")]
    pub task_id: i64,
    #[prost(bool, tag = "6")]
    pub early_return: bool,
    #[prost(string, tag = "7")]
    pub pam: String,
}

impl ApiParam {
    /// 16kHz PCM parameters for the given client id
    pub fn pcm16k(cuid: impl Into<String>, chunk_key: impl Into<String>) -> Self {
        Self {
            cuid: cuid.into(),
            chunk_key: chunk_key.into(),
            sample_rate: 16000,
            format: "pcm".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ApiData {
    #[prost(int32, tag = "1")]
    pub len: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub post_data: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct ApiLast {}

#[derive(Clone, PartialEq, Message)]
pub struct ApiCancel {}

/// Opaque vendor payload, used in both directions
#[derive(Clone, PartialEq, Message)]
pub struct ApiThirdData {
    #[prost(int32, tag = "1")]
    pub len: i32,
    #[prost(string, tag = "2")]
    pub data_type: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub third_data: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct ApiRequest {
    #[prost(enumeration = "RequestType", tag = "1")]
    pub api_req_type: i32,
    #[prost(message, optional, tag = "2")]
    pub param: Option<ApiParam>,
    #[prost(message, optional, tag = "3")]
    pub data: Option<ApiData>,
    #[prost(message, optional, tag = "4")]
    pub last: Option<ApiLast>,
    #[prost(message, optional, tag = "5")]
    pub cancel: Option<ApiCancel>,
    #[prost(message, optional, tag = "6")]
    pub third_data: Option<ApiThirdData>,
}

/// Recognized words plus the words the recognizer was unsure about
#[derive(Clone, PartialEq, Eq, Message)]
pub struct AsrResult {
    #[prost(string, repeated, tag = "1")]
    pub word: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub uncertain_word: Vec<String>,
}

impl AsrResult {
    pub fn words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            word: words.into_iter().map(Into::into).collect(),
            uncertain_word: Vec::new(),
        }
    }

    /// Words concatenated without separators, the way the recognizer's
    /// segmentation is meant to be read back.
    pub fn utterance(&self) -> String {
        self.word.concat()
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ApiResponse {
    #[prost(enumeration = "ResponseType", tag = "1")]
    pub resp_type: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(int32, tag = "3")]
    pub err_no: i32,
    #[prost(string, tag = "4")]
    pub err_msg: String,
    #[prost(message, optional, tag = "5")]
    pub result: Option<AsrResult>,
    #[prost(message, optional, tag = "6")]
    pub third_data: Option<ApiThirdData>,
}

// ============================================================================
// Request frames (client → ASR backend)
// ============================================================================

/// One outbound record
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFrame {
    Auth(ApiParam),
    Param(ApiParam),
    /// Audio block; its length travels alongside it on the wire
    Data(Bytes),
    Last,
    Cancel,
    ThirdData(ApiThirdData),
}

impl RequestFrame {
    /// LAST and CANCEL end the upload
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestFrame::Last | RequestFrame::Cancel)
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            RequestFrame::Auth(_) => RequestType::Auth,
            RequestFrame::Param(_) => RequestType::Param,
            RequestFrame::Data(_) => RequestType::Data,
            RequestFrame::Last => RequestType::Last,
            RequestFrame::Cancel => RequestType::Cancel,
            RequestFrame::ThirdData(_) => RequestType::ThirdData,
        }
    }

    /// Split audio into DATA frames of exactly `block_size` bytes, plus one
    /// shorter frame for any remainder. Empty audio yields no frames.
    pub fn data_blocks(audio: &[u8], block_size: usize) -> Vec<RequestFrame> {
        let block_size = block_size.max(1);
        let audio = Bytes::copy_from_slice(audio);
        (0..audio.len())
            .step_by(block_size)
            .map(|start| {
                let end = (start + block_size).min(audio.len());
                RequestFrame::Data(audio.slice(start..end))
            })
            .collect()
    }
}

impl From<&RequestFrame> for ApiRequest {
    fn from(frame: &RequestFrame) -> Self {
        let mut request = ApiRequest {
            api_req_type: frame.request_type() as i32,
            ..Default::default()
        };
        match frame {
            RequestFrame::Auth(param) | RequestFrame::Param(param) => {
                request.param = Some(param.clone());
            }
            RequestFrame::Data(block) => {
                request.data = Some(ApiData {
                    len: i32::try_from(block.len()).unwrap_or(i32::MAX),
                    post_data: block.clone(),
                });
            }
            RequestFrame::Last => request.last = Some(ApiLast {}),
            RequestFrame::Cancel => request.cancel = Some(ApiCancel {}),
            RequestFrame::ThirdData(third) => request.third_data = Some(third.clone()),
        }
        request
    }
}

impl TryFrom<ApiRequest> for RequestFrame {
    type Error = CodecError;

    fn try_from(request: ApiRequest) -> Result<Self, Self::Error> {
        let kind = RequestType::try_from(request.api_req_type)
            .map_err(|_| CodecError::UnknownFrameType(request.api_req_type))?;
        match kind {
            RequestType::Auth => request
                .param
                .map(RequestFrame::Auth)
                .ok_or(CodecError::MissingPayload("auth param")),
            RequestType::Param => request
                .param
                .map(RequestFrame::Param)
                .ok_or(CodecError::MissingPayload("param")),
            RequestType::Data => request
                .data
                .map(|data| RequestFrame::Data(data.post_data))
                .ok_or(CodecError::MissingPayload("audio data")),
            RequestType::Last => Ok(RequestFrame::Last),
            RequestType::Cancel => Ok(RequestFrame::Cancel),
            RequestType::ThirdData => request
                .third_data
                .map(RequestFrame::ThirdData)
                .ok_or(CodecError::MissingPayload("third data")),
            RequestType::Unspecified => Err(CodecError::UnknownFrameType(request.api_req_type)),
        }
    }
}

impl Frame for RequestFrame {
    fn encode_body(&self) -> Vec<u8> {
        ApiRequest::from(self).encode_to_vec()
    }

    fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        let request =
            ApiRequest::decode(body).map_err(|e| CodecError::InvalidBody(e.to_string()))?;
        RequestFrame::try_from(request)
    }
}

// ============================================================================
// Response frames (ASR backend → client)
// ============================================================================

/// One inbound record: the backend's response id plus the typed payload
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: String,
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// Interim transcript
    Middle(AsrResult),
    Third(ApiThirdData),
    /// Keep-alive
    Heart,
    /// Final-candidate transcript
    Res {
        err_no: i32,
        err_msg: String,
        result: AsrResult,
    },
    /// End of response; the result may be replaced by augmentation
    Last { result: Option<AsrResult> },
}

impl ResponseFrame {
    pub fn middle<I, S>(id: impl Into<String>, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            kind: ResponseKind::Middle(AsrResult::words(words)),
        }
    }

    pub fn res(id: impl Into<String>, err_no: i32, result: AsrResult) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Res {
                err_no,
                err_msg: String::new(),
                result,
            },
        }
    }

    /// Error RES frame, used to terminate a truncated sequence
    pub fn failure(id: impl Into<String>, err_no: i32, err_msg: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Res {
                err_no,
                err_msg: err_msg.into(),
                result: AsrResult::default(),
            },
        }
    }

    pub fn heart(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Heart,
        }
    }

    pub fn last(id: impl Into<String>, result: Option<AsrResult>) -> Self {
        Self {
            id: id.into(),
            kind: ResponseKind::Last { result },
        }
    }

    pub fn response_type(&self) -> ResponseType {
        match self.kind {
            ResponseKind::Middle(_) => ResponseType::Middle,
            ResponseKind::Third(_) => ResponseType::Third,
            ResponseKind::Heart => ResponseType::Heart,
            ResponseKind::Res { .. } => ResponseType::Res,
            ResponseKind::Last { .. } => ResponseType::Last,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self.kind, ResponseKind::Last { .. })
    }

    /// A RES frame eligible for augmentation: no error and no uncertain words.
    /// Returns the concatenated utterance.
    pub fn clean_utterance(&self) -> Option<String> {
        match &self.kind {
            ResponseKind::Res { err_no: 0, result, .. } if result.uncertain_word.is_empty() => {
                Some(result.utterance())
            }
            _ => None,
        }
    }

    /// Result payload carried by this frame, if any
    pub fn result(&self) -> Option<&AsrResult> {
        match &self.kind {
            ResponseKind::Middle(result) => Some(result),
            ResponseKind::Res { result, .. } => Some(result),
            ResponseKind::Last { result } => result.as_ref(),
            ResponseKind::Third(_) | ResponseKind::Heart => None,
        }
    }

    /// Replace a LAST frame's payload with a single-entry word list.
    /// Returns false (and changes nothing) for any other frame type.
    pub fn replace_last_result(&mut self, text: String) -> bool {
        match &mut self.kind {
            ResponseKind::Last { result } => {
                *result = Some(AsrResult {
                    word: vec![text],
                    uncertain_word: Vec::new(),
                });
                true
            }
            _ => false,
        }
    }
}

impl From<&ResponseFrame> for ApiResponse {
    fn from(frame: &ResponseFrame) -> Self {
        let mut response = ApiResponse {
            resp_type: frame.response_type() as i32,
            id: frame.id.clone(),
            ..Default::default()
        };
        match &frame.kind {
            ResponseKind::Middle(result) => response.result = Some(result.clone()),
            ResponseKind::Third(third) => response.third_data = Some(third.clone()),
            ResponseKind::Heart => {}
            ResponseKind::Res {
                err_no,
                err_msg,
                result,
            } => {
                response.err_no = *err_no;
                response.err_msg = err_msg.clone();
                response.result = Some(result.clone());
            }
            ResponseKind::Last { result } => response.result = result.clone(),
        }
        response
    }
}

impl TryFrom<ApiResponse> for ResponseFrame {
    type Error = CodecError;

    fn try_from(response: ApiResponse) -> Result<Self, Self::Error> {
        let resp_type = ResponseType::try_from(response.resp_type)
            .map_err(|_| CodecError::UnknownFrameType(response.resp_type))?;
        let kind = match resp_type {
            ResponseType::Middle => ResponseKind::Middle(response.result.unwrap_or_default()),
            ResponseType::Third => ResponseKind::Third(response.third_data.unwrap_or_default()),
            ResponseType::Heart => ResponseKind::Heart,
            ResponseType::Res => ResponseKind::Res {
                err_no: response.err_no,
                err_msg: response.err_msg,
                result: response.result.unwrap_or_default(),
            },
            ResponseType::Last => ResponseKind::Last {
                result: response.result,
            },
            ResponseType::Unspecified => {
                return Err(CodecError::UnknownFrameType(response.resp_type))
            }
        };
        Ok(ResponseFrame {
            id: response.id,
            kind,
        })
    }
}

impl Frame for ResponseFrame {
    fn encode_body(&self) -> Vec<u8> {
        ApiResponse::from(self).encode_to_vec()
    }

    fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        let response =
            ApiResponse::decode(body).map_err(|e| CodecError::InvalidBody(e.to_string()))?;
        ResponseFrame::try_from(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_blocks_split_with_remainder() {
        let audio: Vec<u8> = (0..25u8).collect();
        let blocks = RequestFrame::data_blocks(&audio, 10);

        assert_eq!(blocks.len(), 3);
        match &blocks[2] {
            RequestFrame::Data(block) => assert_eq!(block.as_ref(), &[20, 21, 22, 23, 24]),
            other => panic!("Expected Data, got {:?}", other),
        }
    }

    #[test]
    fn test_data_blocks_exact_multiple_has_no_empty_tail() {
        let audio = vec![7u8; 20];
        let blocks = RequestFrame::data_blocks(&audio, 10);
        assert_eq!(blocks.len(), 2);
        assert!(RequestFrame::data_blocks(&[], 10).is_empty());
    }

    #[test]
    fn test_terminal_markers() {
        assert!(RequestFrame::Last.is_terminal());
        assert!(RequestFrame::Cancel.is_terminal());
        assert!(!RequestFrame::Data(Bytes::from_static(b"x")).is_terminal());
    }

    #[test]
    fn test_data_request_carries_length() {
        let frame = RequestFrame::Data(Bytes::from_static(b"abcd"));
        let request = ApiRequest::from(&frame);

        assert_eq!(request.api_req_type, RequestType::Data as i32);
        assert_eq!(request.data.as_ref().map(|d| d.len), Some(4));
    }

    #[test]
    fn test_request_missing_payload_is_rejected() {
        let request = ApiRequest {
            api_req_type: RequestType::Data as i32,
            ..Default::default()
        };
        assert!(matches!(
            RequestFrame::try_from(request),
            Err(CodecError::MissingPayload(_))
        ));
    }

    #[test]
    fn test_unknown_response_type_is_rejected() {
        let response = ApiResponse {
            resp_type: 42,
            ..Default::default()
        };
        assert!(matches!(
            ResponseFrame::try_from(response),
            Err(CodecError::UnknownFrameType(42))
        ));
    }

    #[test]
    fn test_clean_utterance_concatenates_words() {
        let frame = ResponseFrame::res("r1", 0, AsrResult::words(["turn", "on", "lights"]));
        assert_eq!(frame.clean_utterance(), Some("turnonlights".to_string()));
    }

    #[test]
    fn test_uncertain_words_are_not_clean() {
        let mut result = AsrResult::words(["turn", "on"]);
        result.uncertain_word.push("lights".to_string());
        let frame = ResponseFrame::res("r1", 0, result);
        assert_eq!(frame.clean_utterance(), None);
    }

    #[test]
    fn test_error_res_is_not_clean() {
        let frame = ResponseFrame::res("r1", -3001, AsrResult::words(["hi"]));
        assert_eq!(frame.clean_utterance(), None);
    }

    #[test]
    fn test_replace_last_result_only_touches_last() {
        let mut last = ResponseFrame::last("r1", None);
        assert!(last.replace_last_result("lights_on_command".to_string()));
        assert_eq!(
            last.result().map(|r| r.word.clone()),
            Some(vec!["lights_on_command".to_string()])
        );

        let mut heart = ResponseFrame::heart("r1");
        assert!(!heart.replace_last_result("x".to_string()));
        assert_eq!(heart, ResponseFrame::heart("r1"));
    }

    #[test]
    fn test_last_without_result_stays_absent_on_wire() {
        let frame = ResponseFrame::last("r1", None);
        let decoded = ResponseFrame::decode_body(&frame.encode_body()).unwrap();
        assert_eq!(decoded, frame);
    }
}
