mod invariant;
