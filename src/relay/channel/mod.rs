#[cfg(feature = "provider-gemini")]
pub mod gemini;
// Zhipu v4 speaks the OpenAI response shape and reuses its handlers.
#[cfg(any(feature = "provider-openai", feature = "provider-zhipu"))]
pub mod openai;
#[cfg(feature = "provider-zhipu")]
pub mod zhipu;
