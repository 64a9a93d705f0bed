pub const BUILD_NUMBER: &str = "952ce29d-bb00-4f1b-a4fb-d9d673058ca7";
