mod judge;
mod response;

pub use judge::{parse_judge_response, JudgeVerdict, SENTINEL_SCORE};
pub use response::{parse_response, response_matchers, MarkerMatcher, ParsedResponse, ResponseFormat};
