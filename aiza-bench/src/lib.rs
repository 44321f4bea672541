/// Synthetic finance-chat corpus shared by the benchmarks.
pub fn corpus(docs: usize) -> Vec<String> {
    const SUBJECTS: [&str; 5] = ["rent", "groceries", "savings", "fuel", "utilities"];
    const VERBS: [&str; 4] = ["spent", "budgeted", "saved", "owe"];
    (0..docs)
        .map(|i| {
            format!(
                "I {} ${}.{:02} on {} this month, didn't I? Let's review it.",
                VERBS[i % VERBS.len()],
                (i * 37) % 2000,
                i % 100,
                SUBJECTS[(i / 3) % SUBJECTS.len()],
            )
        })
        .collect()
}
