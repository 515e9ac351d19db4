pub mod actions;
pub mod feedbacks;

pub use actions::ActionFragment;
pub use feedbacks::FeedbackFragment;
